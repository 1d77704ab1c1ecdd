//! Two-band priority mailbox used by workers.

use std::collections::VecDeque;

use crate::core::request::{Priority, Request};

/// Dual-band request queue: the urgent band drains before the normal band,
/// FIFO within each band. `AboveAvg` requests prepend to the normal band so
/// they run ahead of queued normal load but never overtake urgent traffic.
///
/// Past `saturation` queued requests, placement degrades to plain FIFO
/// appends so per-message work stays bounded under overload; priority
/// placement resumes once the queue drains below the threshold.
pub(crate) struct BandQueue<V> {
    urgent: VecDeque<Request<V>>,
    normal: VecDeque<Request<V>>,
    saturation: usize,
}

impl<V> BandQueue<V> {
    pub fn new(saturation: usize) -> Self {
        Self {
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            saturation,
        }
    }

    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }

    pub fn push(&mut self, req: Request<V>) {
        if self.len() >= self.saturation {
            self.normal.push_back(req);
            return;
        }
        match req.priority {
            // `Now` requests are normally executed at placement; one that
            // reaches the queue (a non-read) is treated as front-of-line.
            Priority::Now => self.urgent.push_front(req),
            Priority::Urgent => self.urgent.push_back(req),
            Priority::AboveAvg => self.normal.push_front(req),
            Priority::Normal => self.normal.push_back(req),
        }
    }

    pub fn pop(&mut self) -> Option<Request<V>> {
        self.urgent.pop_front().or_else(|| self.normal.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::{CallTimeout, Verb};

    /// A request whose read callback replies `tag`, so drain order can be
    /// recovered from the paired receivers.
    fn probe(
        priority: Priority,
        tag: u32,
    ) -> (Request<u32>, tokio::sync::oneshot::Receiver<u32>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let verb: Verb<u32> = Verb::Get(Box::new(move |_| {
            let _ = tx.send(tag);
        }));
        (Request::new(verb, priority, CallTimeout::Infinite), rx)
    }

    fn drain_order(mut q: BandQueue<u32>) -> Vec<Priority> {
        let mut order = Vec::new();
        while let Some(req) = q.pop() {
            order.push(req.priority);
        }
        order
    }

    #[test]
    fn urgent_band_drains_first_fifo_within_band() {
        let mut q = BandQueue::new(64);
        let mut rxs = Vec::new();
        for (priority, tag) in [
            (Priority::Normal, 1),
            (Priority::Urgent, 2),
            (Priority::Normal, 3),
            (Priority::Urgent, 4),
        ] {
            let (req, rx) = probe(priority, tag);
            q.push(req);
            rxs.push((tag, rx));
        }
        let mut served = Vec::new();
        while let Some(req) = q.pop() {
            let Verb::Get(f) = req.verb else { unreachable!() };
            f(Ok(None));
            for (tag, rx) in &mut rxs {
                if rx.try_recv().is_ok() {
                    served.push(*tag);
                }
            }
        }
        assert_eq!(served, vec![2, 4, 1, 3]);
    }

    #[test]
    fn above_avg_sits_between_urgent_and_normal() {
        let mut q = BandQueue::new(64);
        for priority in [Priority::Normal, Priority::Urgent, Priority::AboveAvg] {
            let (req, _rx) = probe(priority, 0);
            q.push(req);
        }
        assert_eq!(
            drain_order(q),
            vec![Priority::Urgent, Priority::AboveAvg, Priority::Normal]
        );
    }

    #[test]
    fn saturated_queue_falls_back_to_fifo() {
        let mut q = BandQueue::new(2);
        for priority in [Priority::Normal, Priority::Normal, Priority::Urgent] {
            let (req, _rx) = probe(priority, 0);
            q.push(req);
        }
        // The urgent request arrived past the threshold and was appended.
        assert_eq!(
            drain_order(q),
            vec![Priority::Normal, Priority::Normal, Priority::Urgent]
        );
    }

    #[test]
    fn empty_queue_pops_none() {
        let mut q: BandQueue<u32> = BandQueue::new(8);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert!(q.pop().is_none());
    }
}
