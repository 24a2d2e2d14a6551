//! Last known block height, shared by the fetch tasks

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
struct BlockInner {
    number: u64,
    updated_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct BlockState {
    inner: RwLock<BlockInner>,
}

impl BlockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `number` if it is newer; returns whether it was
    pub fn update(&self, number: u64) -> bool {
        let mut inner = self.inner.write();
        if number <= inner.number {
            return false;
        }
        inner.number = number;
        inner.updated_at = Some(Instant::now());
        true
    }

    /// 0 until the first block is observed
    pub fn current(&self) -> u64 {
        self.inner.read().number
    }

    pub fn updated_at(&self) -> Option<Instant> {
        self.inner.read().updated_at
    }

    /// Whether the height changed less than `window` ago
    pub fn changed_within(&self, window: Duration) -> bool {
        match self.updated_at() {
            Some(at) => at.elapsed() < window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_only_newer_blocks_move_the_clock() {
        let state = BlockState::new();
        assert_eq!(state.current(), 0);
        assert!(!state.changed_within(Duration::from_secs(5)));

        assert!(state.update(100));
        assert!(state.changed_within(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!state.update(100));
        assert!(!state.update(99));
        assert!(!state.changed_within(Duration::from_secs(5)));
        assert_eq!(state.current(), 100);
    }
}
