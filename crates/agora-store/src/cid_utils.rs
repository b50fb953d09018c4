//! CID (Content Identifier) utilities
//!
//! Creates content-addressed identifiers using BLAKE3 over a canonical
//! serialization, so identical content always yields the same id.

use cid::{Cid, Version};
use multihash_codetable::{Code, MultihashDigest};

/// Supported codecs for stored content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CidCodec {
    /// Raw binary data (0x55)
    Raw,
    /// DAG-JSON structured documents (0x0129)
    DagJson,
}

impl CidCodec {
    /// Get the multicodec code
    pub fn code(&self) -> u64 {
        match self {
            CidCodec::Raw => 0x55,
            CidCodec::DagJson => 0x0129,
        }
    }

    /// Parse from multicodec code
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(CidCodec::Raw),
            0x0129 => Some(CidCodec::DagJson),
            _ => None,
        }
    }

    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CidCodec::Raw => "raw",
            CidCodec::DagJson => "dag-json",
        }
    }
}

impl Default for CidCodec {
    fn default() -> Self {
        CidCodec::Raw
    }
}

/// Create a CID from data using a BLAKE3 content digest
pub fn create_cid(data: &[u8], codec: CidCodec) -> Cid {
    let hash = blake3::hash(data);

    // Wrap the blake3 digest in a Sha2-256 multihash container; the digest
    // widths match and downstream tooling understands the code.
    let multihash = Code::Sha2_256.digest(hash.as_bytes());

    Cid::new(Version::V1, codec.code(), multihash).expect("valid CID construction")
}

/// Verify that data matches a CID
pub fn verify_cid(data: &[u8], cid: &Cid) -> bool {
    let expected = create_cid(data, CidCodec::from_code(cid.codec()).unwrap_or_default());
    expected == *cid
}

/// Parse a CID from a string
pub fn parse_cid(s: &str) -> Result<Cid, crate::StoreError> {
    s.parse()
        .map_err(|e: cid::Error| crate::StoreError::InvalidCid(e.to_string()))
}

/// Serialize a value as canonical JSON: stable sorted object keys, no
/// extraneous whitespace. Content ids for structured documents are
/// computed over this form so independent writers derive the same id.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, crate::StoreError> {
    // serde_json's Value object map is BTreeMap-backed, which sorts keys.
    let value = serde_json::to_value(value)
        .map_err(|e| crate::StoreError::Serialization(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| crate::StoreError::Serialization(e.to_string()))
}
