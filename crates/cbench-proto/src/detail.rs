//! Opaque detail blobs attached to build responses.
//!
//! Workers attach logs, benchmark reports and similar artifacts as text.
//! Binary or bulky payloads go through an optional compression step and a
//! text encoding step before they are embedded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{ProtoError, Result};

/// Compression applied to a detail before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
}

/// Text encoding applied to a detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Base64,
}

/// A typed blob embedded in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDetail {
    /// What the blob is, e.g. `build-log` or `jmh-report`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,

    pub data: String,
}

impl BuildDetail {
    /// Embeds plain text without any transform.
    pub fn text(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            compression: None,
            encoding: None,
            data: data.into(),
        }
    }

    /// Applies `compression` then `encoding` to `bytes`.
    ///
    /// Compressed output is binary, so compression requires an encoding.
    pub fn pack(
        kind: impl Into<String>,
        bytes: &[u8],
        compression: Option<Compression>,
        encoding: Option<Encoding>,
    ) -> Result<Self> {
        let kind = kind.into();

        let compressed = match compression {
            None => bytes.to_vec(),
            Some(_) if encoding.is_none() => {
                return Err(ProtoError::UnencodedCompression { kind });
            }
            Some(Compression::Gzip) => gzip(bytes).map_err(|source| ProtoError::Compression {
                kind: kind.clone(),
                source,
            })?,
        };

        let data = match encoding {
            Some(Encoding::Base64) => STANDARD.encode(&compressed),
            None => String::from_utf8(compressed)
                .map_err(|_| ProtoError::NotText { kind: kind.clone() })?,
        };

        Ok(Self {
            kind,
            compression,
            encoding,
            data,
        })
    }

    /// Reverses [`pack`](Self::pack), returning the original bytes.
    pub fn unpack(&self) -> Result<Vec<u8>> {
        let decoded = match self.encoding {
            Some(Encoding::Base64) => {
                STANDARD
                    .decode(&self.data)
                    .map_err(|source| ProtoError::Base64 {
                        kind: self.kind.clone(),
                        source,
                    })?
            }
            None => self.data.as_bytes().to_vec(),
        };

        match self.compression {
            None => Ok(decoded),
            Some(Compression::Gzip) => {
                let mut out = Vec::new();
                GzDecoder::new(decoded.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|source| ProtoError::Compression {
                        kind: self.kind.clone(),
                        source,
                    })?;
                Ok(out)
            }
        }
    }

    /// Unpacks and interprets the result as UTF-8.
    pub fn unpack_text(&self) -> Result<String> {
        String::from_utf8(self.unpack()?).map_err(|_| ProtoError::NotText {
            kind: self.kind.clone(),
        })
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
