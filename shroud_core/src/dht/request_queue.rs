//! Managing DHT transaction ids and their timeouts.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::Instant;

use crate::time::{clock_elapsed, clock_now};

/// Stores outstanding transaction ids with the moment they were issued and
/// some generic companion data.
#[derive(Clone, Debug)]
pub struct RequestQueue<T> {
    txs: HashMap<u64, (Instant, T)>,
    timeout: Duration,
}

impl<T> RequestQueue<T> {
    pub fn new(timeout: Duration) -> Self {
        RequestQueue {
            txs: HashMap::new(),
            timeout,
        }
    }

    fn generate_tx_id(&self) -> u64 {
        let mut rng = thread_rng();
        loop {
            let tx_id = rng.gen();
            if tx_id != 0 && !self.txs.contains_key(&tx_id) {
                return tx_id;
            }
        }
    }

    /// Issue and remember a unique non-zero transaction id.
    pub fn new_tx_id(&mut self, data: T) -> u64 {
        let tx_id = self.generate_tx_id();
        self.txs.insert(tx_id, (clock_now(), data));
        tx_id
    }

    /** Redeem a transaction id: if it is known, not timed out and the data
    satisfies the condition, remove it and return the stored data. An id
    can be redeemed only once.
    */
    pub fn check_tx_id<F: FnOnce(&T) -> bool>(&mut self, tx_id: u64, cond: F) -> Option<T> {
        if tx_id == 0 {
            return None;
        }
        if let Entry::Occupied(entry) = self.txs.entry(tx_id) {
            let (issued, data) = entry.get();
            if clock_elapsed(*issued) <= self.timeout && cond(data) {
                let (_tx_id, (_issued, data)) = entry.remove_entry();
                Some(data)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Remove timed out transactions and return their data for failure
    /// handling.
    pub fn drain_timed_out(&mut self) -> Vec<(u64, T)> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .txs
            .iter()
            .filter(|(_, (issued, _))| clock_elapsed(*issued) > timeout)
            .map(|(tx_id, _)| *tx_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|tx_id| self.txs.remove(&tx_id).map(|(_, data)| (tx_id, data)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_tx_id_is_stored() {
        let mut queue = RequestQueue::new(Duration::from_secs(42));
        let tx_id = queue.new_tx_id(7);
        assert_ne!(tx_id, 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.check_tx_id(tx_id, |&data| data == 7), Some(7));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn check_tx_id_redeems_once() {
        let mut queue = RequestQueue::new(Duration::from_secs(42));
        let tx_id = queue.new_tx_id(());
        assert!(queue.check_tx_id(tx_id, |_| true).is_some());
        assert!(queue.check_tx_id(tx_id, |_| true).is_none());
    }

    #[tokio::test]
    async fn check_tx_id_respects_condition() {
        let mut queue = RequestQueue::new(Duration::from_secs(42));
        let tx_id = queue.new_tx_id(7);
        assert_eq!(queue.check_tx_id(tx_id, |&data| data == 6), None);
        assert_eq!(queue.check_tx_id(tx_id, |&data| data == 7), Some(7));
    }

    #[tokio::test]
    async fn zero_is_never_valid() {
        let mut queue = RequestQueue::<()>::new(Duration::from_secs(42));
        assert_eq!(queue.check_tx_id(0, |_| true), None);
    }

    #[tokio::test]
    async fn timed_out_ids_are_drained() {
        tokio::time::pause();
        let mut queue = RequestQueue::new(Duration::from_secs(10));
        let tx_id_1 = queue.new_tx_id(1);
        tokio::time::advance(Duration::from_secs(6)).await;
        let tx_id_2 = queue.new_tx_id(2);
        tokio::time::advance(Duration::from_secs(5)).await;

        let drained = queue.drain_timed_out();
        assert_eq!(drained, vec![(tx_id_1, 1)]);
        assert_eq!(queue.check_tx_id(tx_id_1, |_| true), None);
        assert_eq!(queue.check_tx_id(tx_id_2, |_| true), Some(2));
    }
}
