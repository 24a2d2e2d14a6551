//! Status → balance → status consistency check
//!
//! A balance is only attributed to a set of activity statuses if the
//! statuses read before and after the balance agree. Otherwise an activity
//! completed mid-read and the balance may already include (or still miss)
//! its effect.

use super::errors::ReconcileError;
use crate::config::DoubleCheckConfig;
use crate::logging::CycleLogger;
use crate::metrics::ReserveMetrics;
use crate::types::{ActivityId, ActivityStatus};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub type StatusMap = BTreeMap<ActivityId, ActivityStatus>;

/// One source of truth: the chain, or a single exchange
#[async_trait]
pub trait StatusSource: Send + Sync {
    type Balance: Send;

    fn name(&self) -> String;

    async fn statuses(&self) -> Result<StatusMap, ReconcileError>;

    async fn balance(&self) -> Result<Self::Balance, ReconcileError>;
}

#[derive(Debug, Clone)]
pub struct DoubleCheckPolicy {
    pub max_rounds: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
}

impl DoubleCheckPolicy {
    pub fn from_config(config: &DoubleCheckConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Delay before round `round + 2`
    fn backoff(&self, round: u32) -> Duration {
        let exp_backoff = (self.base_backoff_ms as f64) * 2_f64.powi(round as i32);
        let capped_backoff = exp_backoff.min(self.max_backoff_ms as f64);

        let jitter_range = capped_backoff * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped_backoff + jitter).max(0.0) as u64)
    }
}

impl Default for DoubleCheckPolicy {
    fn default() -> Self {
        Self::from_config(&DoubleCheckConfig::default())
    }
}

/// Accepted statuses together with the balance read between them
#[derive(Debug)]
pub struct Checked<B> {
    pub statuses: StatusMap,
    pub balance: B,
    pub rounds: u32,
}

fn same_statuses(a: &StatusMap, c: &StatusMap) -> bool {
    a.len() == c.len()
        && a.iter().zip(c.iter()).all(|((id_a, sa), (id_c, sc))| {
            id_a == id_c && sa.consistency_key() == sc.consistency_key()
        })
}

/// Run the protocol against `source` until two consecutive status reads
/// agree, giving up after `policy.max_rounds`.
pub async fn double_check<S: StatusSource + ?Sized>(
    source: &S,
    policy: &DoubleCheckPolicy,
    logger: &CycleLogger,
    metrics: Option<&ReserveMetrics>,
) -> Result<Checked<S::Balance>, ReconcileError> {
    let name = source.name();

    for round in 0..policy.max_rounds {
        if round > 0 {
            logger.log_double_check_retry(&name, round + 1);
            sleep(policy.backoff(round - 1)).await;
        }
        if let Some(metrics) = metrics {
            metrics.double_check_rounds.inc();
        }

        let before = source.statuses().await?;
        let balance = source.balance().await?;
        let after = source.statuses().await?;

        if same_statuses(&before, &after) {
            return Ok(Checked {
                statuses: after,
                balance,
                rounds: round + 1,
            });
        }
    }

    if let Some(metrics) = metrics {
        metrics.double_check_unstable.inc();
    }
    warn!(source = %name, rounds = policy.max_rounds, "Statuses never stabilized");
    Err(ReconcileError::Unstable {
        origin: name,
        rounds: policy.max_rounds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Domain, ExchangeStatus, MiningStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports `Pending` for the first `flips` status reads, then `Done`
    struct FlippingSource {
        reads: AtomicU32,
        flips: u32,
        balance_reads: AtomicU32,
    }

    impl FlippingSource {
        fn new(flips: u32) -> Self {
            Self {
                reads: AtomicU32::new(0),
                flips,
                balance_reads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusSource for FlippingSource {
        type Balance = u32;

        fn name(&self) -> String {
            "flipping".to_string()
        }

        async fn statuses(&self) -> Result<StatusMap, ReconcileError> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst);
            let exchange_status = if read < self.flips {
                ExchangeStatus::Pending
            } else {
                ExchangeStatus::Done
            };
            Ok(BTreeMap::from([(
                ActivityId::new(1, "w"),
                ActivityStatus {
                    exchange_status,
                    mining_status: MiningStatus::Unset,
                    tx_hash: None,
                    block: None,
                    fee: None,
                    error: None,
                },
            )]))
        }

        async fn balance(&self) -> Result<u32, ReconcileError> {
            Ok(self.balance_reads.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn policy(max_rounds: u32) -> DoubleCheckPolicy {
        DoubleCheckPolicy {
            max_rounds,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_stable_source_accepts_first_round() {
        let source = FlippingSource::new(0);
        let logger = CycleLogger::new(Domain::Auth);
        let checked = double_check(&source, &policy(5), &logger, None).await.unwrap();
        assert_eq!(checked.rounds, 1);
        assert_eq!(checked.balance, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flip_causes_second_round_with_stable_result() {
        // A = Pending, C = Done → retry; A = Done, C = Done → accept
        let source = FlippingSource::new(1);
        let logger = CycleLogger::new(Domain::Auth);
        let metrics = ReserveMetrics::new().unwrap();

        let checked = double_check(&source, &policy(5), &logger, Some(&metrics))
            .await
            .unwrap();

        assert_eq!(checked.rounds, 2);
        assert_eq!(checked.balance, 1);
        let status = checked.statuses.values().next().unwrap();
        assert_eq!(status.exchange_status, ExchangeStatus::Done);
        assert_eq!(metrics.double_check_rounds.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_rounds() {
        // every round sees a flip between A and C
        struct AlwaysMoving(AtomicU32);

        #[async_trait]
        impl StatusSource for AlwaysMoving {
            type Balance = ();

            fn name(&self) -> String {
                "moving".to_string()
            }

            async fn statuses(&self) -> Result<StatusMap, ReconcileError> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                let mut status = ActivityStatus {
                    exchange_status: ExchangeStatus::Pending,
                    mining_status: MiningStatus::Pending,
                    tx_hash: None,
                    block: None,
                    fee: None,
                    error: None,
                };
                if n % 2 == 1 {
                    status.mining_status = MiningStatus::Mined;
                }
                Ok(BTreeMap::from([(ActivityId::new(1, "x"), status)]))
            }

            async fn balance(&self) -> Result<(), ReconcileError> {
                Ok(())
            }
        }

        let source = AlwaysMoving(AtomicU32::new(0));
        let logger = CycleLogger::new(Domain::Auth);
        let metrics = ReserveMetrics::new().unwrap();
        let err = double_check(&source, &policy(3), &logger, Some(&metrics))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::Unstable {
                origin: "moving".to_string(),
                rounds: 3
            }
        );
        assert_eq!(metrics.double_check_unstable.get(), 1);
        assert_eq!(source.0.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy(10);
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(8), Duration::from_millis(100));
    }
}
