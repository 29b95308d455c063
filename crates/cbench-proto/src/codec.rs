//! Text encoding of records for queue transport.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ProtoError, Result};

/// Encodes a record as a JSON text payload.
pub fn encode<T: Serialize>(record: &T) -> Result<String> {
    serde_json::to_string(record).map_err(ProtoError::Encode)
}

/// Decodes a JSON text payload into a record.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(ProtoError::Decode)
}
