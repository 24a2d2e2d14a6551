//! Full reconciliation cycles against scripted chain and exchange

use super::test_helpers::{pricing_operator, token, Harness, HOUR_MS, T0};
use crate::collaborators::{ChainError, Storage, StorageError, TxLookup};
use crate::metrics::ReserveMetrics;
use crate::reconcile::ReconcileError;
use crate::types::Domain;
use crate::types::{
    ActivityRecord, ExchangeId, ExchangeStatus, MiningStatus, TradeSide, TxHash,
};
use std::sync::Arc;

fn trade(order_id: &str, exchange: &str) -> ActivityRecord {
    ActivityRecord::new_trade(
        T0,
        ExchangeId::from(exchange),
        "KNC",
        "ETH",
        TradeSide::Buy,
        0.002,
        100.0,
        order_id,
    )
}

#[tokio::test]
async fn test_deposit_settles_on_both_sides() {
    let h = Harness::new();
    let hash = TxHash::repeat_byte(0x11);
    let record = ActivityRecord::new_deposit(
        T0,
        ExchangeId::from("binance"),
        "ETH",
        1.5,
        pricing_operator(),
        hash,
        3,
        10,
    );
    h.storage.put_activity(record.clone()).await.unwrap();

    h.chain.script_tx(
        hash,
        [TxLookup::Confirmed {
            block: 100,
            receipt_status: Some(true),
        }],
    );
    h.binance.script_status(&hash.to_string(), [ExchangeStatus::Done]);
    h.chain.set_balance("ETH", 42);
    h.binance.set_available("ETH", 1.5);

    let snapshot = h.engine.reconcile(T0 + 10_000, 100).await.unwrap();
    assert!(snapshot.valid, "unexpected error: {:?}", snapshot.error);
    assert!(snapshot.pending_activities.is_empty());
    assert_eq!(snapshot.chain_balances.get("ETH"), Some(&42));
    let binance = snapshot
        .exchange_balances
        .get(&ExchangeId::from("binance"))
        .unwrap();
    assert!(binance.valid);
    assert_eq!(binance.available.get("ETH"), Some(&1.5));

    let stored = h.storage.get_activity(&record.id).await.unwrap();
    assert_eq!(stored.mining_status, MiningStatus::Mined);
    assert_eq!(stored.exchange_status, ExchangeStatus::Done);
    assert_eq!(stored.result.block, Some(100));
    assert!(h.storage.pending_activities().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_flip_during_balance_read_forces_second_round() {
    let h = Harness::new();
    let record = trade("ord-1", "binance");
    h.storage.put_activity(record.clone()).await.unwrap();
    // A = pending, C = done, then done for good
    h.binance
        .script_status("ord-1", [ExchangeStatus::Pending, ExchangeStatus::Done]);

    let snapshot = h.engine.reconcile(T0 + 1_000, 10).await.unwrap();

    assert!(snapshot.valid);
    assert_eq!(h.binance.balance_calls(), 2);
    let stored = h.storage.get_activity(&record.id).await.unwrap();
    assert_eq!(stored.exchange_status, ExchangeStatus::Done);
    assert!(snapshot.pending_activities.is_empty());
}

#[tokio::test]
async fn test_exchange_outage_keeps_last_known_balance() {
    let h = Harness::new();
    h.binance.set_available("ETH", 5.0);

    let first = h.engine.reconcile(T0, 100).await.unwrap();
    assert!(first.valid);

    h.binance.set_down(true);
    let second = h.engine.reconcile(T0 + 5_000, 101).await.unwrap();

    assert!(!second.valid);
    assert!(second.error.as_deref().unwrap().contains("binance"));
    let entry = second
        .exchange_balances
        .get(&ExchangeId::from("binance"))
        .unwrap();
    assert!(!entry.valid);
    assert!(entry.error.is_some());
    assert_eq!(entry.available.get("ETH"), Some(&5.0));
}

#[tokio::test]
async fn test_unreadable_history_during_outage_aborts_instead_of_zeroing() {
    let h = Harness::new();
    h.binance.set_available("ETH", 5.0);
    h.engine.reconcile(T0, 100).await.unwrap();

    h.binance.set_down(true);
    h.storage
        .fail_version_reads(Some(StorageError::Backend("io".to_string())));
    let err = h.engine.reconcile(T0 + 5_000, 101).await.unwrap_err();

    assert_eq!(
        err,
        ReconcileError::Storage(StorageError::Backend("io".to_string()))
    );
    assert!(!err.is_transient());

    h.storage.fail_version_reads(None);
    let latest = h.storage.latest_auth_data(T0 + 5_000).await.unwrap();
    assert_eq!(latest.timepoint, T0);
    let entry = &latest.exchange_balances[&ExchangeId::from("binance")];
    assert_eq!(entry.available.get("ETH"), Some(&5.0));
}

#[tokio::test]
async fn test_outage_without_history_reports_invalid_entry() {
    let h = Harness::new();
    h.binance.set_down(true);

    let snapshot = h.engine.reconcile(T0, 100).await.unwrap();

    assert!(!snapshot.valid);
    let entry = &snapshot.exchange_balances[&ExchangeId::from("binance")];
    assert!(!entry.valid);
    assert!(entry.error.is_some());
    assert_eq!(h.storage.current_version(Domain::Auth, T0).await.unwrap(), T0);
}

#[tokio::test]
async fn test_chain_balance_failure_carries_previous_balances() {
    let h = Harness::new();
    h.chain.set_balance("KNC", 7_000);
    h.engine.reconcile(T0, 100).await.unwrap();

    h.chain.fail_balances(Some(ChainError::rpc("connection reset")));
    let snapshot = h.engine.reconcile(T0 + 5_000, 101).await.unwrap();

    assert!(!snapshot.valid);
    assert!(snapshot.error.as_deref().unwrap().contains("blockchain"));
    assert_eq!(snapshot.chain_balances.get("KNC"), Some(&7_000));
}

#[tokio::test]
async fn test_activity_past_max_lifetime_is_failed() {
    let h = Harness::new();
    let record = trade("ord-stale", "binance");
    h.storage.put_activity(record.clone()).await.unwrap();
    h.binance.script_status("ord-stale", [ExchangeStatus::Pending]);

    let snapshot = h.engine.reconcile(T0 + 6 * HOUR_MS + 1, 10).await.unwrap();

    assert!(snapshot.valid);
    assert!(snapshot.pending_activities.is_empty());
    let stored = h.storage.get_activity(&record.id).await.unwrap();
    assert_eq!(stored.exchange_status, ExchangeStatus::Failed);
}

#[tokio::test]
async fn test_lost_transaction_written_off_once_nonce_consumed() {
    let metrics = Arc::new(ReserveMetrics::new().unwrap());
    let h = Harness::with_metrics(metrics.clone());
    let hash = TxHash::repeat_byte(0x22);
    let record = ActivityRecord::new_set_rates(
        T0,
        vec![token(1)],
        vec![1_000],
        vec![1_000],
        90,
        pricing_operator(),
        hash,
        7,
        10,
    );
    h.storage.put_activity(record.clone()).await.unwrap();
    h.chain.script_tx(hash, [TxLookup::NotFound]);

    // nonce 7 not mined yet: the tx may still show up
    h.chain.set_mined_nonce(pricing_operator(), 7);
    let first = h.engine.reconcile(T0 + 60_000, 100).await.unwrap();
    assert!(first.valid, "unexpected error: {:?}", first.error);
    assert_eq!(first.pending_activities.len(), 1);
    assert_eq!(first.pending_activities[0].mining_status, MiningStatus::Lost);

    h.chain.set_mined_nonce(pricing_operator(), 8);
    let second = h.engine.reconcile(T0 + 120_000, 101).await.unwrap();
    assert!(second.pending_activities.is_empty());

    let stored = h.storage.get_activity(&record.id).await.unwrap();
    assert_eq!(stored.mining_status, MiningStatus::Failed);
    assert_eq!(h.engine.trusted_mined_nonce(pricing_operator()).await, Some(8));
    assert_eq!(metrics.lost_escalations.get(), 1);
    assert_eq!(metrics.pending_activities.get(), 0);
}

#[tokio::test]
async fn test_repeated_cycles_without_news_change_nothing() {
    let h = Harness::new();
    let record = trade("ord-2", "binance");
    h.storage.put_activity(record.clone()).await.unwrap();
    h.binance.script_status("ord-2", [ExchangeStatus::Pending]);

    let first = h.engine.reconcile(T0 + 1_000, 10).await.unwrap();
    let stored_first = h.storage.get_activity(&record.id).await.unwrap();
    let second = h.engine.reconcile(T0 + 2_000, 10).await.unwrap();
    let stored_second = h.storage.get_activity(&record.id).await.unwrap();

    assert_eq!(stored_first.exchange_status, ExchangeStatus::Pending);
    assert_eq!(stored_first, stored_second);
    assert_eq!(first.pending_activities, second.pending_activities);
}

#[tokio::test]
async fn test_activity_on_unconfigured_exchange_is_reported() {
    let h = Harness::new();
    h.storage
        .put_activity(trade("ord-3", "kraken"))
        .await
        .unwrap();

    let snapshot = h.engine.reconcile(T0 + 1_000, 10).await.unwrap();

    assert!(!snapshot.valid);
    assert!(snapshot
        .error
        .as_deref()
        .unwrap()
        .contains("kraken: exchange not configured"));
    assert_eq!(snapshot.pending_activities.len(), 1);
}
