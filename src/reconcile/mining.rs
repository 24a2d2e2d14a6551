//! Mining status from a transaction lookup

use crate::collaborators::TxLookup;
use crate::types::{ActivityRecord, MiningStatus, Timepoint};

/// Raw classification of a lookup
pub fn classify(lookup: TxLookup) -> (MiningStatus, Option<u64>) {
    match lookup {
        TxLookup::NotFound => (MiningStatus::Lost, None),
        TxLookup::Pending => (MiningStatus::Pending, None),
        // chains without receipt status only confirm successful execution
        TxLookup::Confirmed {
            block,
            receipt_status: Some(false),
        } => (MiningStatus::Failed, Some(block)),
        TxLookup::Confirmed { block, .. } => (MiningStatus::Mined, Some(block)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningResolution {
    pub status: MiningStatus,
    pub block: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MiningResolver {
    lost_expiry_ms: u64,
}

impl MiningResolver {
    pub fn new(lost_expiry_secs: u64) -> Self {
        Self {
            lost_expiry_ms: lost_expiry_secs.saturating_mul(1000),
        }
    }

    /// Whether a lost transaction can be written off. Its nonce has been
    /// consumed once the operator's mined nonce is past it.
    pub fn lost_is_failed(
        &self,
        record: &ActivityRecord,
        trusted_mined_nonce: Option<u64>,
        now: Timepoint,
    ) -> bool {
        let nonce_consumed = match (trusted_mined_nonce, record.result.nonce) {
            (Some(trusted), Some(nonce)) => trusted > nonce,
            _ => false,
        };
        let expired = now.saturating_sub(record.created_at) > self.lost_expiry_ms;
        nonce_consumed || expired
    }

    pub fn resolve(
        &self,
        record: &ActivityRecord,
        lookup: TxLookup,
        trusted_mined_nonce: Option<u64>,
        now: Timepoint,
    ) -> MiningResolution {
        let (status, block) = classify(lookup);
        let status = if status == MiningStatus::Lost
            && self.lost_is_failed(record, trusted_mined_nonce, now)
        {
            MiningStatus::Failed
        } else {
            status
        };
        MiningResolution { status, block }
    }
}
