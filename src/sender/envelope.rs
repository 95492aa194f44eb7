use crate::buffer::EventBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Ack decode error: {0}")]
    Ack(#[from] serde_json::Error),
}

/// One event on the wire: an opaque type tag plus its serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub type_tag: String,
    pub payload: Vec<u8>,
}

/// The request body dispatched for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub req_guid: String,
    /// Milliseconds since the Unix epoch, refreshed on every (re)send.
    pub sent_time: i64,
    pub events: Vec<EventRecord>,
}

impl RequestEnvelope {
    pub fn from_batch(batch: &EventBatch, sent_at: DateTime<Utc>) -> Self {
        Self {
            req_guid: batch.uuid().to_string(),
            sent_time: sent_at.timestamp_millis(),
            events: batch
                .events()
                .iter()
                .map(|event| EventRecord {
                    type_tag: event.type_tag.clone(),
                    payload: event.payload.to_vec(),
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        Ok(Bytes::from(encoded))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(envelope)
    }

    /// Re-encodes `encoded` with a new send timestamp.
    pub fn refresh_sent_time(encoded: &[u8], sent_at: DateTime<Utc>) -> Result<Bytes, EnvelopeError> {
        let mut envelope = Self::decode(encoded)?;
        envelope.sent_time = sent_at.timestamp_millis();
        envelope.encode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckCode {
    BadRequest,
    MaxConnectionLimitReached,
    #[serde(other)]
    Unknown,
}

/// Collector acknowledgement, correlated to a request by `req_guid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub req_guid: Uuid,
    pub status: AckStatus,
    #[serde(default)]
    pub code: Option<AckCode>,
}

impl AckResponse {
    pub fn success(req_guid: Uuid) -> Self {
        Self {
            req_guid,
            status: AckStatus::Success,
            code: None,
        }
    }

    pub fn error(req_guid: Uuid, code: Option<AckCode>) -> Self {
        Self {
            req_guid,
            status: AckStatus::Error,
            code,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Bytes {
        // Serializing this struct to JSON cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}
