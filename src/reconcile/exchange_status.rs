//! Exchange-side status of an activity, dispatched by action kind

use super::errors::ReconcileError;
use crate::collaborators::{Exchange, ExchangeError};
use crate::types::{millis, ActivityAction, ActivityRecord, ActivityStatus, ExchangeStatus, Timepoint};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExchangeResolver {
    max_lifetime_ms: u64,
    call_timeout: Duration,
}

impl ExchangeResolver {
    pub fn new(max_lifetime_secs: u64, call_timeout: Duration) -> Self {
        Self {
            max_lifetime_ms: max_lifetime_secs.saturating_mul(1000),
            call_timeout,
        }
    }

    pub fn is_expired(&self, record: &ActivityRecord, now: Timepoint) -> bool {
        now.saturating_sub(record.created_at) > self.max_lifetime_ms
    }

    async fn query(
        &self,
        exchange: &dyn Exchange,
        record: &ActivityRecord,
    ) -> Result<ActivityStatus, ReconcileError> {
        let call = async {
            let mut status = ActivityStatus::unchanged(record);
            match &record.action {
                ActivityAction::Trade {
                    base,
                    quote,
                    order_id,
                    ..
                } => {
                    status.exchange_status = exchange.order_status(order_id, base, quote).await?;
                }
                ActivityAction::Deposit { asset, amount, .. } => {
                    let tx_hash = record.result.tx_hash.ok_or_else(|| {
                        ExchangeError::NotFound(format!("deposit {} has no tx hash", record.id))
                    })?;
                    status.exchange_status = exchange
                        .deposit_status(&record.id, tx_hash, asset, *amount, record.created_at)
                        .await?;
                }
                ActivityAction::Withdraw {
                    asset,
                    amount,
                    withdraw_id,
                    ..
                } => {
                    let withdraw = exchange
                        .withdraw_status(withdraw_id, asset, *amount, record.created_at)
                        .await?;
                    status.exchange_status = withdraw.status;
                    if withdraw.tx_hash.is_some() {
                        status.tx_hash = withdraw.tx_hash;
                    }
                    if withdraw.fee.is_some() {
                        status.fee = withdraw.fee;
                    }
                }
                ActivityAction::SetRates { .. } => {}
            }
            Ok::<_, ExchangeError>(status)
        };

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ReconcileError::Timeout {
                origin: exchange.id().to_string(),
                timeout_ms: millis(self.call_timeout),
            }),
        }
    }

    /// Resolve one activity. Query failures become the status error; an
    /// activity past its maximum lifetime is failed whatever the exchange
    /// says.
    pub async fn resolve(
        &self,
        exchange: &dyn Exchange,
        record: &ActivityRecord,
        now: Timepoint,
    ) -> ActivityStatus {
        let result = self.query(exchange, record).await;

        if self.is_expired(record, now) {
            let mut status = result.unwrap_or_else(|_| ActivityStatus::unchanged(record));
            status.exchange_status = ExchangeStatus::Failed;
            status.error = None;
            return status;
        }

        match result {
            Ok(status) => status,
            Err(e) => {
                let mut status = ActivityStatus::unchanged(record);
                status.error = Some(e.to_string());
                status
            }
        }
    }
}
