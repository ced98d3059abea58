//! Mined-block publish/subscribe
//!
//! The miner hands each committed block to a broadcast channel and returns to
//! its search loop immediately. Subscribers receive events in the order they
//! were mined, each at most once; a subscriber that falls behind by more than
//! the channel capacity is told how many events it missed.

use crate::core::{Block, BlockHash};
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber
pub const EVENT_CAPACITY: usize = 256;

/// A block mined and committed by this node
#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub block: Block,
    pub hash: BlockHash,
    /// This block's contribution to cumulative chain work
    pub chain_cost: u64,
    /// Chain height after the block was committed
    pub height: u64,
}

/// Publisher side of the mined-block channel
#[derive(Clone)]
pub struct MinedEvents {
    sender: broadcast::Sender<MinedBlock>,
}

impl MinedEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a subscriber. Only events published after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<MinedBlock> {
        self.sender.subscribe()
    }

    /// Hand an event to all subscribers without blocking.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: MinedBlock) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MinedEvents {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::mine_test_block;

    fn event(n: u64) -> MinedBlock {
        let block = mine_test_block(vec![n.to_be_bytes().to_vec()], 1, n as f64);
        MinedBlock {
            hash: block.hash(),
            chain_cost: block.chain_cost(),
            height: n,
            block,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let events = MinedEvents::default();
        assert_eq!(events.publish(event(1)), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let events = MinedEvents::default();
        let mut a = events.subscribe();
        let mut b = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        for n in 1..=3 {
            assert_eq!(events.publish(event(n)), 2);
        }

        for n in 1..=3 {
            assert_eq!(a.recv().await.unwrap().height, n);
            assert_eq!(b.recv().await.unwrap().height, n);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let events = MinedEvents::new(2);
        let mut slow = events.subscribe();

        for n in 1..=5 {
            events.publish(event(n));
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(slow.recv().await.unwrap().height, 4);
    }
}
