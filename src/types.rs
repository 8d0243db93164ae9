//! Record model shared by the index store, the bulk store and the tiering engine.
//!
//! A record's payload lives in exactly one tier at a time. That rule is carried
//! by [`Location`]: an entry is either `Inline` with its payload or `Archived`
//! with a pointer to the bulk object, so an entry holding both (or neither)
//! cannot be constructed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a record id
pub const MAX_RECORD_ID_LEN: usize = 128;

/// Maximum serialized size of a record's metadata (bytes)
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

/// Structured attributes kept in the index regardless of tier
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Validation failures for incoming records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRecord {
    #[error("record id must not be empty")]
    EmptyId,

    #[error("record id exceeds {max} characters")]
    IdTooLong { max: usize },

    #[error("record id contains invalid character {0:?}")]
    InvalidIdChar(char),

    #[error("record id must not start with '.'")]
    LeadingDot,

    #[error("metadata is {size} bytes, limit is {max}")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("metadata is not serializable: {0}")]
    MetadataEncoding(String),
}

/// Globally unique, immutable record identifier.
///
/// Ids are restricted to `[A-Za-z0-9._-]` so the derived bulk key is safe to
/// use as an object name on every backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Parse and validate a record id
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidRecord> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(InvalidRecord::EmptyId);
        }
        if raw.chars().count() > MAX_RECORD_ID_LEN {
            return Err(InvalidRecord::IdTooLong {
                max: MAX_RECORD_ID_LEN,
            });
        }
        if raw.starts_with('.') {
            return Err(InvalidRecord::LeadingDot);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(InvalidRecord::InvalidIdChar(bad));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = InvalidRecord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RecordId {
    type Error = InvalidRecord;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// Key of an archived payload in the bulk object store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    /// Derive the bulk key for a record.
    ///
    /// Deterministic in the id alone, so every retry of the same record
    /// targets the same object.
    pub fn derive(id: &RecordId) -> Self {
        Self(format!("{}.bin", id.as_str()))
    }

    /// Wrap a key read back from storage
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex-encoded SHA-256 digest of a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pointer from an archived index entry to its bulk object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPointer {
    pub key: BlobKey,
    pub size: u64,
    pub sha256: Checksum,
}

impl BlobPointer {
    /// Describe the bulk object a payload will be archived as
    pub fn for_payload(id: &RecordId, payload: &[u8]) -> Self {
        Self {
            key: BlobKey::derive(id),
            size: payload.len() as u64,
            sha256: Checksum::of(payload),
        }
    }

    /// Check that fetched bytes are exactly the archived payload
    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        bytes.len() as u64 == self.size && Checksum::of(bytes) == self.sha256
    }
}

/// Where a record's payload currently lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Location {
    /// Payload stored directly in the index entry
    Inline { payload: Vec<u8> },
    /// Payload stored in the bulk object store
    Archived { blob: BlobPointer },
}

impl Location {
    pub fn tier(&self) -> TierKind {
        match self {
            Location::Inline { .. } => TierKind::Inline,
            Location::Archived { .. } => TierKind::Archived,
        }
    }
}

/// Tier discriminant, used for conditional updates and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Inline,
    Archived,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Inline => "inline",
            TierKind::Archived => "archived",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(TierKind::Inline),
            "archived" => Ok(TierKind::Archived),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Authoritative index entry for a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub location: Location,
}

impl IndexEntry {
    pub fn tier(&self) -> TierKind {
        self.location.tier()
    }

    /// Inline payload, if the record has not been archived
    pub fn inline_payload(&self) -> Option<&[u8]> {
        match &self.location {
            Location::Inline { payload } => Some(payload),
            Location::Archived { .. } => None,
        }
    }

    /// Bulk pointer, if the record has been archived
    pub fn blob(&self) -> Option<&BlobPointer> {
        match &self.location {
            Location::Inline { .. } => None,
            Location::Archived { blob } => Some(blob),
        }
    }

    /// The same record pointing at its bulk copy, payload dropped
    pub fn archived_with(&self, blob: BlobPointer) -> Self {
        Self {
            id: self.id.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            location: Location::Archived { blob },
        }
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            tier: self.tier(),
        }
    }
}

/// A record as handed in by an upstream producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub payload: Vec<u8>,
}

impl NewRecord {
    pub fn new(id: RecordId, timestamp: DateTime<Utc>, metadata: Metadata, payload: Vec<u8>) -> Self {
        Self {
            id,
            timestamp,
            metadata,
            payload,
        }
    }

    /// Check size bounds on the metadata
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        let size = serde_json::to_vec(&self.metadata)
            .map_err(|e| InvalidRecord::MetadataEncoding(e.to_string()))?
            .len();
        if size > MAX_METADATA_BYTES {
            return Err(InvalidRecord::MetadataTooLarge {
                size,
                max: MAX_METADATA_BYTES,
            });
        }
        Ok(())
    }

    /// Build the initial inline index entry.
    ///
    /// Timestamps are truncated to millisecond precision, the resolution
    /// every index backend stores.
    pub fn into_entry(self) -> IndexEntry {
        IndexEntry {
            id: self.id,
            timestamp: truncate_to_millis(self.timestamp),
            metadata: self.metadata,
            location: Location::Inline {
                payload: self.payload,
            },
        }
    }
}

/// Uniform view returned by the retrieval path, whatever the tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
    /// Tier the payload was served from
    pub tier: TierKind,
}

/// Metadata-only listing row, served without touching bulk storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub tier: TierKind,
}

pub(crate) fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
