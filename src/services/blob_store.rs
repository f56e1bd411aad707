//! src/services/blob_store.rs
//!
//! BlobStore - writes, reads and deletes upload payloads in one flat
//! directory. Files are named by `ObjectId`, never by anything the client
//! sent. The store knows nothing about expiry; it only guarantees that a
//! name being written is never mistaken for an orphan.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    collections::HashSet,
    ffi::OsStr,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};

use crate::{
    errors::{StoreError, StoreResult},
    services::id_generator::ObjectId,
};

/// Content-type / extension allowlist applied before any byte is written.
///
/// Entries starting with `.` match the filename extension, entries with a
/// `/` match the MIME type (`image/*` matches the whole family). An empty
/// list accepts everything.
#[derive(Clone, Debug, Default)]
pub struct TypeAllowlist {
    entries: Vec<String>,
}

impl TypeAllowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    pub fn check(&self, mime_type: &str, original_name: &str) -> StoreResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }

        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let extension = Path::new(original_name)
            .extension()
            .and_then(OsStr::to_str)
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()));

        let allowed = self.entries.iter().any(|entry| {
            if entry.starts_with('.') {
                extension.as_deref() == Some(entry.as_str())
            } else if let Some(family) = entry.strip_suffix("/*") {
                mime.split('/').next() == Some(family)
            } else {
                *entry == mime
            }
        });

        if allowed {
            Ok(())
        } else {
            Err(StoreError::InvalidType(mime_type.to_string()))
        }
    }
}

/// Result of a completed write.
///
/// Holds the name reservation until dropped, so the caller keeps the blob
/// safe from the orphan sweep until its metadata is registered.
#[derive(Debug)]
pub struct StoredBlob<'a> {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub etag: String,
    _reservation: Reservation<'a>,
}

/// Marks a file name as in flight. Released on drop.
#[derive(Debug)]
struct Reservation<'a> {
    store: &'a BlobStore,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.store
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

/// One file found under the storage root.
#[derive(Debug)]
pub struct BlobEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Lazy, one-shot listing of the storage root.
///
/// Entries are read from the directory as they are requested; call
/// `BlobStore::list_all` again for a fresh snapshot.
pub struct BlobListing {
    entries: fs::ReadDir,
}

impl BlobListing {
    /// Next regular file, skipping directories and entries that vanished
    /// while listing.
    pub async fn next_blob(&mut self) -> io::Result<Option<BlobEntry>> {
        while let Some(entry) = self.entries.next_entry().await? {
            match entry.file_type().await {
                Ok(kind) if kind.is_file() => {
                    return Ok(Some(BlobEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        path: entry.path(),
                    }));
                }
                Ok(_) => debug!("skipping non-file entry {}", entry.path().display()),
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    allowlist: TypeAllowlist,
    reserved: Mutex<HashSet<String>>,
}

impl BlobStore {
    /// Create a store rooted at `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>, allowlist: TypeAllowlist) -> Self {
        Self {
            root: root.into(),
            allowlist,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn reserve(&self, name: &str) -> Reservation<'_> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
        Reservation {
            store: self,
            name: name.to_string(),
        }
    }

    /// True while a write for `name` is in flight.
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    /// Stream an upload to `root/{id}`.
    ///
    /// - Checks the type allowlist before touching the disk.
    /// - Creates the file exclusively; an existing name is never overwritten.
    /// - Enforces `size_limit` per chunk, so at most one chunk beyond the
    ///   limit is ever held in memory.
    /// - Computes the MD5 etag while streaming.
    ///
    /// Any failure removes the partial file before returning.
    pub async fn put<S>(
        &self,
        id: &ObjectId,
        stream: S,
        size_limit: u64,
        mime_type: &str,
        original_name: &str,
    ) -> StoreResult<StoredBlob<'_>>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.allowlist.check(mime_type, original_name)?;

        let reservation = self.reserve(id.as_str());
        let path = self.path_for(id);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        match write_limited(&mut file, stream, size_limit).await {
            Ok((size_bytes, etag)) => Ok(StoredBlob {
                path,
                size_bytes,
                etag,
                _reservation: reservation,
            }),
            Err(err) => {
                drop(file);
                if let Err(cleanup) = self.delete(&path).await {
                    warn!(
                        path = %path.display(),
                        error = %cleanup,
                        "failed to remove partial upload; the sweep will retry"
                    );
                }
                Err(err)
            }
        }
    }

    /// Open a blob for streaming out.
    pub async fn open_for_read(&self, path: &Path) -> StoreResult<File> {
        File::open(path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::StorageIo(err)
            }
        })
    }

    /// Remove a blob. Returns `false` if it was already gone.
    pub async fn delete(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("removed blob {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list_all(&self) -> io::Result<BlobListing> {
        Ok(BlobListing {
            entries: fs::read_dir(&self.root).await?,
        })
    }

    /// Delete every file under the root. Used once at startup, before any
    /// upload is accepted, since blobs from a previous process have no
    /// metadata left.
    pub async fn purge_all(&self) -> io::Result<usize> {
        let mut listing = self.list_all().await?;
        let mut removed = 0;
        while let Some(entry) = listing.next_blob().await? {
            if self.delete(&entry.path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Write, read back and delete a scratch file under the root.
    pub async fn probe(&self) -> io::Result<()> {
        let name = match ObjectId::generate() {
            Ok(id) => format!(".probe-{id}"),
            Err(err) => return Err(io::Error::other(err)),
        };
        let _reservation = self.reserve(&name);
        let path = self.root.join(&name);

        fs::write(&path, b"probe").await?;
        let read_back = fs::read(&path).await;
        self.delete(&path).await?;
        if read_back? != b"probe" {
            return Err(io::Error::new(ErrorKind::InvalidData, "probe content mismatch"));
        }
        Ok(())
    }
}

async fn write_limited<S>(file: &mut File, stream: S, size_limit: u64) -> StoreResult<(u64, String)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut size_bytes: u64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as u64;
        if size_bytes > size_limit {
            return Err(StoreError::SizeExceeded { limit: size_limit });
        }
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((size_bytes, format!("{:x}", digest.compute())))
}
