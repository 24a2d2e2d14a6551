//! Set-rate submission end to end

use super::test_helpers::{pricing_operator, reserve_section, token, T0};
use crate::collaborators::{
    AbiValue, Blockchain, BroadcastNode, MemoryStorage, Storage, StorageError,
};
use crate::nonce_manager::{NonceRegistry, NonceSource};
use crate::rate_codec::{CodecError, RateTarget, SLOTS_PER_BULK};
use crate::rate_setter::{RateSetter, SetRateError, RECORD_ATTEMPTS};
use crate::rpc_manager::Broadcaster;
use crate::test_utils::{
    tx_hash_for, FaultyStorage, MockBlockchain, MockNode, NodeBehavior,
};
use crate::types::{ActivityAction, ExchangeStatus, MiningStatus, TokenRate};
use std::sync::Arc;
use std::time::Duration;

const BASE: u128 = 1_000_000;

struct Setup {
    chain: Arc<MockBlockchain>,
    storage: Arc<FaultyStorage>,
    nonces: Arc<NonceRegistry>,
    nodes: Vec<Arc<MockNode>>,
    setter: RateSetter,
}

async fn setup(behaviors: &[NodeBehavior]) -> Setup {
    let chain = Arc::new(MockBlockchain::new());
    chain.set_block(300);
    chain.set_pending_nonce(pricing_operator(), 5);
    for (i, n) in [1u8, 2].into_iter().enumerate() {
        chain.set_slot(token(n), 0, i as u128);
        chain.set_rate(
            token(n),
            TokenRate {
                base_buy: BASE,
                compact_buy: 0,
                base_sell: BASE,
                compact_sell: 0,
                block: 250,
            },
        );
    }

    let storage = Arc::new(FaultyStorage::new());
    let nonces = Arc::new(NonceRegistry::new(
        NonceSource::Pending,
        Duration::from_secs(120),
        Duration::from_secs(1),
    ));
    let nodes: Vec<Arc<MockNode>> = behaviors
        .iter()
        .enumerate()
        .map(|(i, b)| Arc::new(MockNode::new(&format!("node-{}", i), *b)))
        .collect();
    let broadcaster = Broadcaster::new(
        nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn BroadcastNode>)
            .collect(),
        Duration::from_millis(500),
    );

    let setter = RateSetter::new(
        chain.clone() as Arc<dyn Blockchain>,
        storage.clone() as Arc<dyn Storage>,
        Arc::new(broadcaster),
        nonces.clone(),
        &reserve_section(),
    )
    .unwrap();
    setter
        .reload_token_indices(&[token(1), token(2)])
        .await
        .unwrap();

    Setup {
        chain,
        storage,
        nonces,
        nodes,
        setter,
    }
}

fn target(n: u8, buy: u128, sell: u128) -> RateTarget {
    RateTarget {
        token: token(n),
        buy,
        sell,
    }
}

#[tokio::test]
async fn test_small_moves_go_out_as_compact_data() {
    let s = setup(&[NodeBehavior::Accept, NodeBehavior::Reject]).await;
    let targets = [target(1, 1_010_000, 990_000), target(2, BASE, BASE)];

    let record = s.setter.set_rates(&targets, T0).await.unwrap();

    let calls = s.chain.built_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "setCompactData");
    let mut buys = [0u8; SLOTS_PER_BULK];
    buys[0] = 10;
    let mut sells = [0u8; SLOTS_PER_BULK];
    sells[0] = (-10i8) as u8;
    assert_eq!(calls[0].args[0], AbiValue::Bytes14Array(vec![buys]));
    assert_eq!(calls[0].args[1], AbiValue::Bytes14Array(vec![sells]));
    assert_eq!(calls[0].args[2], AbiValue::Uint(300));
    assert_eq!(calls[0].args[3], AbiValue::UintArray(vec![0]));

    assert_eq!(record.mining_status, MiningStatus::Submitted);
    assert_eq!(record.exchange_status, ExchangeStatus::Unset);
    assert_eq!(record.result.nonce, Some(5));
    assert_eq!(record.result.tx_hash, Some(tx_hash_for(pricing_operator(), 5)));
    assert_eq!(record.result.gas_price, Some(10_000_000_000));
    assert!(matches!(record.action, ActivityAction::SetRates { block: 300, .. }));

    let stored = s.storage.get_activity(&record.id).await.unwrap();
    assert_eq!(stored, record);
    assert_eq!(s.nonces.trusted(pricing_operator()).await, Some(6));
}

#[tokio::test]
async fn test_overflow_rebases_token_in_same_transaction() {
    let s = setup(&[NodeBehavior::Accept]).await;
    // double the base: far outside one signed byte of per-mille steps
    let targets = [target(1, 2 * BASE, BASE), target(2, 1_001_000, BASE)];

    s.setter.set_rates(&targets, T0).await.unwrap();

    let calls = s.chain.built_calls();
    assert_eq!(calls[0].method, "setBaseRate");
    assert_eq!(calls[0].args.len(), 7);
    assert_eq!(calls[0].args[0], AbiValue::AddressArray(vec![token(1)]));
    assert_eq!(calls[0].args[1], AbiValue::UintArray(vec![2 * BASE]));
    let mut buys = [0u8; SLOTS_PER_BULK];
    buys[1] = 1;
    assert_eq!(calls[0].args[3], AbiValue::Bytes14Array(vec![buys]));
}

#[tokio::test]
async fn test_rejected_everywhere_records_nothing_and_frees_nonce() {
    let s = setup(&[NodeBehavior::Reject, NodeBehavior::Unreachable]).await;

    let err = s
        .setter
        .set_rates(&[target(1, 1_010_000, BASE)], T0)
        .await
        .unwrap_err();

    match &err {
        SetRateError::NotBroadcast { errors } => assert_eq!(errors.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_transient());
    assert!(s.storage.pending_activities().await.unwrap().is_empty());
    assert_eq!(s.nonces.trusted(pricing_operator()).await, Some(5));
    assert!(s.nodes.iter().all(|n| n.sent() == 1));
}

#[tokio::test]
async fn test_activity_write_retried_after_storage_hiccup() {
    let s = setup(&[NodeBehavior::Accept]).await;
    s.storage.fail_activity_writes(1);

    let record = s
        .setter
        .set_rates(&[target(1, 1_010_000, BASE)], T0)
        .await
        .unwrap();

    assert_eq!(s.storage.activity_writes(), 2);
    assert_eq!(s.storage.get_activity(&record.id).await.unwrap(), record);
    assert_eq!(s.nodes[0].sent(), 1);
}

#[tokio::test]
async fn test_broadcast_tx_that_cannot_be_stored_is_handed_back() {
    let s = setup(&[NodeBehavior::Accept]).await;
    s.storage.fail_activity_writes(RECORD_ATTEMPTS as usize);

    let err = s
        .setter
        .set_rates(&[target(1, 1_010_000, BASE)], T0)
        .await
        .unwrap_err();

    assert!(!err.is_transient());
    let SetRateError::NotRecorded { record, source } = err else {
        panic!("expected NotRecorded");
    };
    assert_eq!(source, StorageError::Backend("disk full".to_string()));
    assert_eq!(record.result.tx_hash, Some(tx_hash_for(pricing_operator(), 5)));
    assert_eq!(record.result.nonce, Some(5));
    assert_eq!(s.nodes[0].sent(), 1);
    // nonce 5 is on the wire and stays taken
    assert_eq!(s.nonces.trusted(pricing_operator()).await, Some(6));
    assert!(s.storage.pending_activities().await.unwrap().is_empty());

    s.storage.put_activity(*record.clone()).await.unwrap();
    assert_eq!(s.storage.pending_activities().await.unwrap(), vec![*record]);
}

#[tokio::test]
async fn test_gas_price_above_ceiling_is_refused_up_front() {
    let s = setup(&[NodeBehavior::Accept]).await;
    s.setter.set_gas_price(101_000_000_000);

    let err = s
        .setter
        .set_rates(&[target(1, BASE, BASE)], T0)
        .await
        .unwrap_err();

    assert!(matches!(err, SetRateError::GasPriceTooHigh { .. }));
    assert!(s.chain.built_calls().is_empty());
    assert_eq!(s.nodes[0].sent(), 0);
}

#[tokio::test]
async fn test_unlisted_token_is_a_hard_error() {
    let s = setup(&[NodeBehavior::Accept]).await;

    let err = s
        .setter
        .set_rates(&[target(1, BASE, BASE), target(9, BASE, BASE)], T0)
        .await
        .unwrap_err();

    assert_eq!(err, SetRateError::Codec(CodecError::MissingTokenIndex(token(9))));
    assert!(s.chain.built_calls().is_empty());
}

#[tokio::test]
async fn test_unknown_pricing_operator_rejected_at_construction() {
    let mut reserve = reserve_section();
    reserve.pricing_operator = "nobody".to_string();

    let result = RateSetter::new(
        Arc::new(MockBlockchain::new()) as Arc<dyn Blockchain>,
        Arc::new(MemoryStorage::new()) as Arc<dyn Storage>,
        Arc::new(Broadcaster::new(Vec::new(), Duration::from_millis(10))),
        Arc::new(NonceRegistry::new(
            NonceSource::Pending,
            Duration::from_secs(120),
            Duration::from_secs(1),
        )),
        &reserve,
    );

    assert!(matches!(result, Err(SetRateError::UnknownOperator(name)) if name == "nobody"));
}
