//! Folding a cycle's status into the canonical record

use crate::types::{ActivityRecord, ActivityStatus, ExchangeStatus, MiningStatus};

/// Apply `status` to `record`, returning whether anything changed.
///
/// Mining fields move only while the record is blockchain-pending. Exchange
/// fields move only while it is exchange-pending, except that a failure
/// reported for a record that is not yet terminal is always taken. Terminal
/// statuses are never replaced.
pub fn merge(record: &mut ActivityRecord, status: &ActivityStatus) -> bool {
    let before = record.clone();

    if record.is_blockchain_pending() && status.mining_status != MiningStatus::Unset {
        record.mining_status = status.mining_status;
        if status.block.is_some() {
            record.result.block = status.block;
        }
    }

    let newly_failed = status.exchange_status == ExchangeStatus::Failed
        && !record.exchange_status.is_terminal();
    if (record.is_exchange_pending() || newly_failed)
        && status.exchange_status != ExchangeStatus::Unset
    {
        record.exchange_status = status.exchange_status;
        if status.tx_hash.is_some() && record.result.tx_hash.is_none() {
            record.result.tx_hash = status.tx_hash;
        }
        if status.fee.is_some() {
            record.result.fee = status.fee;
        }
    }

    *record != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExchangeId, TxHash};

    fn withdraw() -> ActivityRecord {
        ActivityRecord::new_withdraw(1, ExchangeId::from("huobi"), "KNC", 10.0, "w-9")
    }

    fn status(exchange_status: ExchangeStatus, mining_status: MiningStatus) -> ActivityStatus {
        ActivityStatus {
            exchange_status,
            mining_status,
            tx_hash: None,
            block: None,
            fee: None,
            error: None,
        }
    }

    #[test]
    fn test_exchange_fields_follow_pending_record() {
        let mut record = withdraw();
        let mut update = status(ExchangeStatus::Done, MiningStatus::Unset);
        update.tx_hash = Some(TxHash::repeat_byte(4));
        update.fee = Some(0.5);

        assert!(merge(&mut record, &update));
        assert_eq!(record.exchange_status, ExchangeStatus::Done);
        assert_eq!(record.result.tx_hash, Some(TxHash::repeat_byte(4)));
        assert_eq!(record.result.fee, Some(0.5));
        assert!(!record.is_pending());
    }

    #[test]
    fn test_terminal_never_reverts() {
        let mut record = withdraw();
        record.exchange_status = ExchangeStatus::Done;

        assert!(!merge(&mut record, &status(ExchangeStatus::Pending, MiningStatus::Unset)));
        assert!(!merge(&mut record, &status(ExchangeStatus::Failed, MiningStatus::Unset)));
        assert_eq!(record.exchange_status, ExchangeStatus::Done);
    }

    #[test]
    fn test_failure_propagates_past_stale_pending_flag() {
        let mut record = withdraw();
        record.exchange_status = ExchangeStatus::Unset;

        assert!(!merge(&mut record, &status(ExchangeStatus::Done, MiningStatus::Unset)));
        assert!(merge(&mut record, &status(ExchangeStatus::Failed, MiningStatus::Unset)));
        assert_eq!(record.exchange_status, ExchangeStatus::Failed);
    }

    #[test]
    fn test_mining_fields_frozen_once_mined() {
        let mut record = withdraw();
        record.mining_status = MiningStatus::Mined;
        record.result.block = Some(10);

        let mut update = status(ExchangeStatus::Pending, MiningStatus::Lost);
        update.block = Some(99);
        merge(&mut record, &update);

        assert_eq!(record.mining_status, MiningStatus::Mined);
        assert_eq!(record.result.block, Some(10));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut record = withdraw();
        let update = status(ExchangeStatus::Pending, MiningStatus::Unset);
        merge(&mut record, &update);
        let once = record.clone();
        assert!(!merge(&mut record, &update));
        assert_eq!(record, once);
    }
}
