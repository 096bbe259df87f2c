use std::io::{Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AfrunError, Result};

/// Content address of a sequence: lowercase hex SHA-256 of its UTF-8 bytes.
pub fn sequence_id(sequence: &str) -> String {
    let hash = Sha256::digest(sequence.as_bytes());
    format!("{hash:x}")
}

/// Expensive-to-compute artifacts attached to a sequence.
///
/// `None`, an empty string and an empty template list all count as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(rename = "unpairedMsa")]
    pub unpaired_msa: Option<String>,
    #[serde(rename = "pairedMsa")]
    pub paired_msa: Option<String>,
    pub templates: Option<Vec<Value>>,
}

impl Artifacts {
    pub fn has_unpaired_msa(&self) -> bool {
        self.unpaired_msa.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_paired_msa(&self) -> bool {
        self.paired_msa.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_templates(&self) -> bool {
        self.templates.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.has_unpaired_msa() && self.has_paired_msa() && self.has_templates()
    }

    /// Names of the absent artifacts, in document key spelling.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.has_unpaired_msa() {
            missing.push("unpairedMsa");
        }
        if !self.has_paired_msa() {
            missing.push("pairedMsa");
        }
        if !self.has_templates() {
            missing.push("templates");
        }
        missing
    }

    /// Copy every artifact absent here but present in `other`.
    /// Returns whether anything changed.
    pub fn fill_from(&mut self, other: &Artifacts) -> bool {
        let mut changed = false;
        if !self.has_unpaired_msa() && other.has_unpaired_msa() {
            self.unpaired_msa = other.unpaired_msa.clone();
            changed = true;
        }
        if !self.has_paired_msa() && other.has_paired_msa() {
            self.paired_msa = other.paired_msa.clone();
            changed = true;
        }
        if !self.has_templates() && other.has_templates() {
            self.templates = other.templates.clone();
            changed = true;
        }
        changed
    }
}

/// Decoded payload of one stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub id: String,
    pub sequence: String,
    #[serde(flatten)]
    pub artifacts: Artifacts,
}

/// Row metadata, readable without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical encoding: compact JSON with sorted keys, gzip-compressed.
pub fn encode_payload(record: &SequenceRecord) -> Result<Vec<u8>> {
    // serde_json::Map is a BTreeMap here, so keys come out sorted.
    let value = serde_json::to_value(record)?;
    let raw = serde_json::to_vec(&value)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

pub fn decode_payload(id: &str, blob: &[u8]) -> Result<SequenceRecord> {
    let mut raw = Vec::new();
    GzDecoder::new(blob)
        .read_to_end(&mut raw)
        .map_err(|e| AfrunError::StoreIntegrity {
            id: id.to_string(),
            reason: format!("decompress: {}", e),
        })?;
    serde_json::from_slice(&raw).map_err(|e| AfrunError::StoreIntegrity {
        id: id.to_string(),
        reason: format!("decode: {}", e),
    })
}

/// Fixed-width UTC timestamp; lexical order matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(id: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AfrunError::StoreIntegrity {
            id: id.to_string(),
            reason: format!("timestamp {:?}: {}", s, e),
        })
}
