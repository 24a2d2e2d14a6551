//! Packing compact deltas into 14-byte words

use super::errors::CodecError;
use super::token_index::TokenIndexTable;
use crate::types::{Address, TokenRate};
use std::collections::{BTreeMap, BTreeSet};

pub const SLOTS_PER_BULK: usize = 14;

pub type BulkWord = [u8; SLOTS_PER_BULK];

/// Parallel arrays for `setCompactData`: `buys[i]` and `sells[i]` replace
/// word `indices[i]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactBulk {
    pub buys: Vec<BulkWord>,
    pub sells: Vec<BulkWord>,
    pub indices: Vec<u128>,
}

impl CompactBulk {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Pack the compact deltas of a batch.
///
/// A whole word is rewritten at once, so slots of tokens outside the batch
/// that share a touched word keep their current on-chain delta from
/// `current` (zero when unknown). Every batch token must have a slot.
pub fn build_compact_bulk(
    buys: &BTreeMap<Address, i8>,
    sells: &BTreeMap<Address, i8>,
    table: &TokenIndexTable,
    current: &BTreeMap<Address, TokenRate>,
) -> Result<CompactBulk, CodecError> {
    let mut touched = BTreeSet::new();
    for token in buys.keys().chain(sells.keys()) {
        touched.insert(table.require(token)?.bulk_index);
    }

    let mut bulk = CompactBulk::default();
    for bulk_index in touched {
        let mut buy_word = [0u8; SLOTS_PER_BULK];
        let mut sell_word = [0u8; SLOTS_PER_BULK];

        for (token, slot) in table.tokens_in_bulk(bulk_index) {
            let existing = current.get(token);
            let buy = buys
                .get(token)
                .copied()
                .or_else(|| existing.map(|r| r.compact_buy))
                .unwrap_or(0);
            let sell = sells
                .get(token)
                .copied()
                .or_else(|| existing.map(|r| r.compact_sell))
                .unwrap_or(0);
            buy_word[slot.index_in_bulk] = buy as u8;
            sell_word[slot.index_in_bulk] = sell as u8;
        }

        bulk.buys.push(buy_word);
        bulk.sells.push(sell_word);
        bulk.indices.push(bulk_index as u128);
    }

    Ok(bulk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_codec::TokenSlot;

    fn token(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn table() -> TokenIndexTable {
        let mut table = TokenIndexTable::new();
        for (n, bulk_index, index_in_bulk) in [(1u8, 0, 0), (2, 0, 13), (3, 1, 5), (4, 0, 7)] {
            table
                .insert(token(n), TokenSlot { bulk_index, index_in_bulk })
                .unwrap();
        }
        table
    }

    #[test]
    fn test_packs_bytes_at_assigned_slots() {
        let buys = BTreeMap::from([(token(1), 5i8), (token(2), -1), (token(3), 127)]);
        let sells = BTreeMap::from([(token(1), -128i8), (token(2), 0), (token(3), 1)]);

        let bulk = build_compact_bulk(&buys, &sells, &table(), &BTreeMap::new()).unwrap();

        assert_eq!(bulk.indices, vec![0, 1]);
        assert_eq!(bulk.buys[0][0], 5);
        assert_eq!(bulk.buys[0][13], 0xff);
        assert_eq!(bulk.sells[0][0], 0x80);
        assert_eq!(bulk.buys[1][5], 127);
        assert_eq!(bulk.sells[1][5], 1);
    }

    #[test]
    fn test_untouched_slot_in_word_keeps_current_delta() {
        let buys = BTreeMap::from([(token(1), 3i8)]);
        let sells = BTreeMap::from([(token(1), 3i8)]);
        let current = BTreeMap::from([(
            token(4),
            TokenRate {
                base_buy: 1,
                compact_buy: -7,
                base_sell: 1,
                compact_sell: 9,
                block: 10,
            },
        )]);

        let bulk = build_compact_bulk(&buys, &sells, &table(), &current).unwrap();

        assert_eq!(bulk.indices, vec![0]);
        assert_eq!(bulk.buys[0][7], (-7i8) as u8);
        assert_eq!(bulk.sells[0][7], 9);
        // token 2 shares the word but has no known rate
        assert_eq!(bulk.buys[0][13], 0);
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let buys = BTreeMap::from([(token(1), 1i8), (token(9), 1)]);
        let err = build_compact_bulk(&buys, &BTreeMap::new(), &table(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err, CodecError::MissingTokenIndex(token(9)));
    }
}
