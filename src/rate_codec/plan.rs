//! One rate-update transaction worth of compact words and base rates

use super::bulk::{build_compact_bulk, CompactBulk};
use super::compact::to_compact;
use super::errors::CodecError;
use super::token_index::TokenIndexTable;
use crate::collaborators::{AbiValue, ContractCall, ContractName};
use crate::types::{Address, TokenRate};
use std::collections::{BTreeMap, BTreeSet};

/// Desired full-precision rates for one token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateTarget {
    pub token: Address,
    pub buy: u128,
    pub sell: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRatePlan {
    /// Tokens that could not be expressed as a compact delta
    pub base_updates: Vec<RateTarget>,
    pub bulk: CompactBulk,
    pub block: u64,
}

impl SetRatePlan {
    /// Compact every target against its current on-chain base. If either
    /// side of a token overflows, the token is re-based with both targets
    /// and its compact bytes are reset to 0.
    pub fn build(
        targets: &[RateTarget],
        current: &BTreeMap<Address, TokenRate>,
        table: &TokenIndexTable,
        block: u64,
    ) -> Result<Self, CodecError> {
        let mut seen = BTreeSet::new();
        let mut base_updates = Vec::new();
        let mut buys = BTreeMap::new();
        let mut sells = BTreeMap::new();

        for target in targets {
            if !seen.insert(target.token) {
                return Err(CodecError::DuplicateToken(target.token));
            }
            table.require(&target.token)?;

            let base = current.get(&target.token).copied().unwrap_or_default();
            let buy = to_compact(target.buy, base.base_buy);
            let sell = to_compact(target.sell, base.base_sell);

            if buy.overflow || sell.overflow {
                base_updates.push(*target);
                buys.insert(target.token, 0);
                sells.insert(target.token, 0);
            } else {
                buys.insert(target.token, buy.value);
                sells.insert(target.token, sell.value);
            }
        }

        let bulk = build_compact_bulk(&buys, &sells, table, current)?;
        Ok(Self {
            base_updates,
            bulk,
            block,
        })
    }

    pub fn needs_base_update(&self) -> bool {
        !self.base_updates.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.bulk.is_empty() && self.base_updates.is_empty()
    }

    /// `setBaseRate` when any token was re-based, else `setCompactData`
    pub fn to_call(&self) -> ContractCall {
        let compact_args = vec![
            AbiValue::Bytes14Array(self.bulk.buys.clone()),
            AbiValue::Bytes14Array(self.bulk.sells.clone()),
            AbiValue::Uint(self.block as u128),
            AbiValue::UintArray(self.bulk.indices.clone()),
        ];

        if !self.needs_base_update() {
            return ContractCall::new(ContractName::ConversionRates, "setCompactData", compact_args);
        }

        let mut args = vec![
            AbiValue::AddressArray(self.base_updates.iter().map(|t| t.token).collect()),
            AbiValue::UintArray(self.base_updates.iter().map(|t| t.buy).collect()),
            AbiValue::UintArray(self.base_updates.iter().map(|t| t.sell).collect()),
        ];
        args.extend(compact_args);
        ContractCall::new(ContractName::ConversionRates, "setBaseRate", args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_codec::TokenSlot;

    const ONE: u128 = 1_000_000_000_000_000_000;

    fn token(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn setup() -> (TokenIndexTable, BTreeMap<Address, TokenRate>) {
        let mut table = TokenIndexTable::new();
        table
            .insert(token(1), TokenSlot { bulk_index: 0, index_in_bulk: 0 })
            .unwrap();
        table
            .insert(token(2), TokenSlot { bulk_index: 0, index_in_bulk: 1 })
            .unwrap();
        let rate = TokenRate {
            base_buy: ONE,
            compact_buy: 0,
            base_sell: ONE,
            compact_sell: 0,
            block: 100,
        };
        (table, BTreeMap::from([(token(1), rate), (token(2), rate)]))
    }

    #[test]
    fn test_small_moves_use_compact_data() {
        let (table, current) = setup();
        let targets = [
            RateTarget { token: token(1), buy: ONE * 1010 / 1000, sell: ONE * 995 / 1000 },
            RateTarget { token: token(2), buy: ONE, sell: ONE },
        ];

        let plan = SetRatePlan::build(&targets, &current, &table, 101).unwrap();
        assert!(!plan.needs_base_update());
        assert_eq!(plan.bulk.buys[0][0], 10);
        assert_eq!(plan.bulk.sells[0][0], (-5i8) as u8);

        let call = plan.to_call();
        assert_eq!(call.method, "setCompactData");
        assert_eq!(call.args.len(), 4);
        assert_eq!(call.args[2], AbiValue::Uint(101));
    }

    #[test]
    fn test_overflow_on_one_side_rebases_token_and_zeroes_its_bytes() {
        let (table, current) = setup();
        let targets = [
            RateTarget { token: token(1), buy: ONE * 2, sell: ONE },
            RateTarget { token: token(2), buy: ONE * 1001 / 1000, sell: ONE },
        ];

        let plan = SetRatePlan::build(&targets, &current, &table, 7).unwrap();
        assert_eq!(plan.base_updates, vec![targets[0]]);
        assert_eq!(plan.bulk.buys[0][0], 0);
        assert_eq!(plan.bulk.sells[0][0], 0);
        assert_eq!(plan.bulk.buys[0][1], 1);

        let call = plan.to_call();
        assert_eq!(call.method, "setBaseRate");
        assert_eq!(call.args[0], AbiValue::AddressArray(vec![token(1)]));
        assert_eq!(call.args[1], AbiValue::UintArray(vec![ONE * 2]));
        assert_eq!(call.args.len(), 7);
    }

    #[test]
    fn test_unknown_current_rate_forces_rebase() {
        let (table, _) = setup();
        let targets = [RateTarget { token: token(1), buy: ONE, sell: ONE }];
        let plan = SetRatePlan::build(&targets, &BTreeMap::new(), &table, 1).unwrap();
        assert!(plan.needs_base_update());
    }

    #[test]
    fn test_rejects_duplicates_and_unindexed_tokens() {
        let (table, current) = setup();
        let dup = [
            RateTarget { token: token(1), buy: ONE, sell: ONE },
            RateTarget { token: token(1), buy: ONE, sell: ONE },
        ];
        assert_eq!(
            SetRatePlan::build(&dup, &current, &table, 1),
            Err(CodecError::DuplicateToken(token(1)))
        );

        let missing = [RateTarget { token: token(3), buy: ONE, sell: ONE }];
        assert_eq!(
            SetRatePlan::build(&missing, &current, &table, 1),
            Err(CodecError::MissingTokenIndex(token(3)))
        );
    }
}
