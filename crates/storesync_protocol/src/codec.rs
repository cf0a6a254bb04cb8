//! CBOR encoding of batch payloads.

use crate::batch::{BatchDirection, SyncBatch, SyncRecord};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{EntityType, StoreId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u16 = 1;

/// The transport payload of a batch: its identity plus its records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    /// Envelope format version.
    pub format: u16,
    /// Batch id (the remote side deduplicates on it).
    pub batch_id: Uuid,
    /// Sending store.
    pub store_id: StoreId,
    /// Push or pull.
    pub direction: BatchDirection,
    /// Entity type of every record.
    pub entity_type: EntityType,
    /// Records carried.
    pub records: Vec<SyncRecord>,
}

impl BatchEnvelope {
    /// Builds the envelope for a batch.
    pub fn from_batch(batch: &SyncBatch) -> Self {
        Self {
            format: ENVELOPE_VERSION,
            batch_id: batch.id,
            store_id: batch.store_id,
            direction: batch.direction,
            entity_type: batch.entity_type.clone(),
            records: batch.records.clone(),
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Self =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if envelope.format != ENVELOPE_VERSION {
            return Err(ProtocolError::Decode(format!(
                "unsupported envelope format {}",
                envelope.format
            )));
        }
        Ok(envelope)
    }
}

/// Encodes a batch's records into its transport payload.
pub fn encode_records(batch: &SyncBatch) -> ProtocolResult<Vec<u8>> {
    BatchEnvelope::from_batch(batch).encode()
}

/// Decodes a transport payload.
pub fn decode_records(bytes: &[u8]) -> ProtocolResult<BatchEnvelope> {
    BatchEnvelope::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OperationType;
    use chrono::Utc;

    #[test]
    fn envelope_carries_records() {
        let mut batch = SyncBatch::new(StoreId::new(), BatchDirection::Push, EntityType::new("product"));
        batch.push_record(SyncRecord::new("p-1", OperationType::Create, b"{\"n\":1}".to_vec(), Utc::now()));
        batch.push_record(SyncRecord::new("p-2", OperationType::Delete, Vec::new(), Utc::now()));

        let bytes = encode_records(&batch).unwrap();
        let envelope = decode_records(&bytes).unwrap();

        assert_eq!(envelope.batch_id, batch.id);
        assert_eq!(envelope.entity_type, batch.entity_type);
        assert_eq!(envelope.records, batch.records);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_records(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let batch = SyncBatch::new(StoreId::new(), BatchDirection::Pull, EntityType::new("price"));
        let mut envelope = BatchEnvelope::from_batch(&batch);
        envelope.format = 99;
        let bytes = envelope.encode().unwrap();
        assert!(BatchEnvelope::decode(&bytes).is_err());
    }
}
