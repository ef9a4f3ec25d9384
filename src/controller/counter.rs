//! Sequence Counter - wrapping timer byte carried in every outbound report
//!
//! Exactly one task advances the value; every writer takes a snapshot.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Read side of the counter, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    value: Arc<AtomicU8>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value
    pub fn get(&self) -> u8 {
        self.value.load(Ordering::Acquire)
    }

    fn advance(&self) -> u8 {
        self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    #[cfg(test)]
    pub(crate) fn set(&self, value: u8) {
        self.value.store(value, Ordering::Release);
    }

    /// Spawns the only task allowed to advance the counter.
    ///
    /// Ticks that cannot be serviced on time are dropped, not replayed.
    pub fn spawn_ticker(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let counter = self.clone();
        info!("Starting sequence counter with {:?} period", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Sequence counter stopped at {}", counter.get());
                        break;
                    }
                    _ = interval.tick() => {
                        counter.advance();
                    }
                }
            }
        })
    }
}
