//! Represents an uploaded object and the views of it handed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

use crate::services::id_generator::ObjectId;

const MAX_FILENAME_LEN: usize = 255;
const FALLBACK_FILENAME: &str = "download";

/// What happens to an object once it has been downloaded.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumptionPolicy {
    /// Served to anyone holding the link until the TTL elapses.
    TtlOnly,
    /// Deleted after the first complete download.
    SingleUse,
}

impl FromStr for ConsumptionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ttl" | "ttl-only" => Ok(Self::TtlOnly),
            "single-use" | "once" => Ok(Self::SingleUse),
            other => Err(format!(
                "unknown consumption policy `{other}` (expected `ttl` or `single-use`)"
            )),
        }
    }
}

impl fmt::Display for ConsumptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TtlOnly => f.write_str("ttl-only"),
            Self::SingleUse => f.write_str("single-use"),
        }
    }
}

/// Immutable metadata of a stored object.
///
/// The content bytes live in the blob at `storage_path`; this struct only
/// describes them.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub id: ObjectId,

    /// Blob file owned exclusively by this object.
    pub storage_path: PathBuf,

    /// Client-supplied filename, already sanitized.
    pub original_name: String,

    pub mime_type: String,

    pub size_bytes: u64,

    /// MD5 of the content, hex encoded.
    pub etag: String,

    pub created_at: DateTime<Utc>,

    /// Set once at creation, never extended.
    pub expires_at: DateTime<Utc>,

    pub policy: ConsumptionPolicy,
}

impl ObjectMeta {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Response body for a successful upload.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreatedObject {
    pub id: ObjectId,
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub size: u64,
    pub original_name: String,
    pub policy: ConsumptionPolicy,
}

/// Read-only view returned by the status endpoint.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    pub exists: bool,
    pub id: ObjectId,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub policy: ConsumptionPolicy,
    /// True while a single-use download is in flight.
    pub downloading: bool,
}

/// Reduce a client-supplied filename to something safe to echo back in a
/// `Content-Disposition` header.
///
/// Drops any directory components, control characters, quotes and
/// backslashes, and caps the length on a character boundary.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | '\\' | ';'))
        .collect();

    if cleaned.len() > MAX_FILENAME_LEN {
        let mut cut = MAX_FILENAME_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }

    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}
