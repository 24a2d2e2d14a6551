//! Token → compact slot table, as assigned by the conversion-rates contract

use super::bulk::SLOTS_PER_BULK;
use super::errors::CodecError;
use crate::collaborators::{AbiValue, Blockchain, ContractCall, ContractName};
use crate::types::Address;
use std::collections::BTreeMap;
use tracing::debug;

/// Position of a token's compact byte: word `bulk_index`, byte `index_in_bulk`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenSlot {
    pub bulk_index: usize,
    pub index_in_bulk: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenIndexTable {
    slots: BTreeMap<Address, TokenSlot>,
}

impl TokenIndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: Address, slot: TokenSlot) -> Result<(), CodecError> {
        if slot.index_in_bulk >= SLOTS_PER_BULK {
            return Err(CodecError::SlotOutOfRange {
                token,
                index_in_bulk: slot.index_in_bulk,
                max: SLOTS_PER_BULK - 1,
            });
        }
        self.slots.insert(token, slot);
        Ok(())
    }

    pub fn get(&self, token: &Address) -> Option<TokenSlot> {
        self.slots.get(token).copied()
    }

    /// Slot of `token`, or an error naming it
    pub fn require(&self, token: &Address) -> Result<TokenSlot, CodecError> {
        self.get(token).ok_or(CodecError::MissingTokenIndex(*token))
    }

    /// Other tokens whose compact bytes live in word `bulk_index`
    pub fn tokens_in_bulk(
        &self,
        bulk_index: usize,
    ) -> impl Iterator<Item = (&Address, &TokenSlot)> {
        self.slots
            .iter()
            .filter(move |(_, slot)| slot.bulk_index == bulk_index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Build the table by asking the contract for each token's slot via
    /// `getCompactData(token)`, which answers `(bulkIndex, indexInBulk, buy, sell)`.
    pub async fn load(chain: &dyn Blockchain, tokens: &[Address]) -> Result<Self, CodecError> {
        let mut table = Self::new();
        for token in tokens {
            let call = ContractCall::new(
                ContractName::ConversionRates,
                "getCompactData",
                vec![AbiValue::Address(*token)],
            );
            let values = chain.call(&call).await?;

            let field = |i: usize, name: &str| -> Result<usize, CodecError> {
                values
                    .get(i)
                    .and_then(AbiValue::as_uint)
                    .map(|v| v as usize)
                    .ok_or_else(|| CodecError::MalformedIndex {
                        token: *token,
                        reason: format!("missing {}", name),
                    })
            };

            let slot = TokenSlot {
                bulk_index: field(0, "bulk index")?,
                index_in_bulk: field(1, "index in bulk")?,
            };
            debug!(
                token = %token,
                bulk = slot.bulk_index,
                index = slot.index_in_bulk,
                "Loaded token slot"
            );
            table.insert(*token, slot)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_slot_past_word_end() {
        let mut table = TokenIndexTable::new();
        let token = Address::repeat_byte(1);
        let err = table
            .insert(
                token,
                TokenSlot {
                    bulk_index: 0,
                    index_in_bulk: 14,
                },
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::SlotOutOfRange { index_in_bulk: 14, .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_require_names_missing_token() {
        let table = TokenIndexTable::new();
        let token = Address::repeat_byte(7);
        assert_eq!(table.require(&token), Err(CodecError::MissingTokenIndex(token)));
    }
}
