//! Datatype and status enumerations, plus data-object metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// The three artifacts the precache tracks independently for each entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datatype {
    Data = 1,
    Metadata = 2,
    Checksums = 3,
}

impl Datatype {
    /// All datatypes, in tracking order.
    pub const ALL: [Datatype; 3] = [Datatype::Data, Datatype::Metadata, Datatype::Checksums];

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(id: i64) -> crate::Result<Self> {
        match id {
            1 => Ok(Self::Data),
            2 => Ok(Self::Metadata),
            3 => Ok(Self::Checksums),
            _ => Err(crate::Error::InvalidDatatype(id)),
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Metadata => "metadata",
            Self::Checksums => "checksums",
        };
        write!(f, "{name}")
    }
}

/// Per-datatype production status.
///
/// The numeric ids form a strictly-increasing lattice: normal progress only
/// ever moves to a greater id. The sole backward transition is reset-to-Queued,
/// issued by the tracking index during invalidation, mismatch recovery and
/// startup repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued = 1,
    Started = 2,
    Finished = 3,
    Unknown = 4,
    Failed = 5,
}

impl Status {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(id: i64) -> crate::Result<Self> {
        match id {
            1 => Ok(Self::Queued),
            2 => Ok(Self::Started),
            3 => Ok(Self::Finished),
            4 => Ok(Self::Unknown),
            5 => Ok(Self::Failed),
            _ => Err(crate::Error::InvalidStatus(id)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Unknown => "unknown",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Attribute/value/unit triple attached to a data object upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avu {
    pub attribute: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Upstream-reported metadata for a data object.
///
/// This is both the wire shape returned by the upstream gateway and the JSON
/// shape persisted to the entity's `metadata` sidecar file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Whole-file MD5 as reported by the upstream, lowercase hex.
    pub checksum: String,
    /// Data size in bytes.
    pub size: u64,
    #[serde(with = "time::serde::timestamp")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub modified: OffsetDateTime,
    #[serde(default)]
    pub avus: Vec<Avu>,
}

impl ObjectMetadata {
    /// Whether a freshly fetched copy of the metadata differs in any respect
    /// a refetch cares about: size, checksum or modification time.
    pub fn differs(&self, other: &ObjectMetadata) -> bool {
        self.checksum != other.checksum || self.size != other.size || self.modified != other.modified
    }

    /// The serialized sidecar representation and its exact byte size.
    pub fn to_sidecar_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("object metadata serializes to JSON")
    }
}
