//! Opaque object identifiers.
//!
//! Every identifier is 192 bits drawn from the operating system CSPRNG and
//! encoded as URL-safe base64 without padding. The same token names the blob
//! on disk, so a well-formed identifier can never contain a path separator.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use serde::Serialize;
use std::fmt;

use crate::errors::{StoreError, StoreResult};

const ID_BYTES: usize = 24;

/// Length of the encoded token (4 chars per 3 bytes).
pub const ID_LEN: usize = ID_BYTES / 3 * 4;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Draw a fresh identifier from the OS entropy source.
    pub fn generate() -> StoreResult<Self> {
        let mut raw = [0u8; ID_BYTES];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(StoreError::EntropyExhausted)?;
        Ok(Self(URL_SAFE_NO_PAD.encode(raw)))
    }

    /// Accept only tokens this generator could have produced.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
