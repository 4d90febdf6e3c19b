//! Schema blobs
//!
//! A schema blob is a JSON object stored in the blob store like any
//! other blob, distinguished by its `camliType` field. The variants the
//! proxy understands are modeled as one tagged union; anything else is
//! reported as unsupported rather than guessed at.
//!
//! The file writer chunks a byte stream into content-addressed pieces,
//! stores each piece, then stores the serialized file blob itself. The
//! content ref of an upload is the hash of that serialized file blob.

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::blobref::{BlobRef, DEFAULT_HASH};
use crate::store::BlobStore;
use crate::types::{GateError, Result};

/// Chunk size for the file writer. Fixed-size chunking keeps the chunk
/// refs deterministic for a given byte stream.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// One chunk reference inside a file blob's `parts` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BytesPart {
    pub blob_ref: BlobRef,
    pub size: u64,
}

/// `camliType: "file"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBlob {
    pub camli_version: u32,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_permission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_mtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_ctime: Option<String>,
    #[serde(default)]
    pub parts: Vec<BytesPart>,
}

/// `camliType: "directory"` — its entries live in a static-set blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryBlob {
    pub camli_version: u32,
    pub file_name: String,
    pub entries: BlobRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_permission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_mtime: Option<String>,
}

/// `camliType: "static-set"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticSetBlob {
    pub camli_version: u32,
    #[serde(default)]
    pub members: Vec<BlobRef>,
}

/// `camliType: "symlink"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymlinkBlob {
    pub camli_version: u32,
    pub file_name: String,
    pub symlink_target: String,
}

/// `camliType: "fifo"` / `camliType: "socket"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InodeBlob {
    pub camli_version: u32,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_permission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_mtime: Option<String>,
}

/// The schema blob union the download path switches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "camliType")]
pub enum SchemaBlob {
    #[serde(rename = "file")]
    File(FileBlob),
    #[serde(rename = "directory")]
    Directory(DirectoryBlob),
    #[serde(rename = "static-set")]
    StaticSet(StaticSetBlob),
    #[serde(rename = "symlink")]
    Symlink(SymlinkBlob),
    #[serde(rename = "fifo")]
    Fifo(InodeBlob),
    #[serde(rename = "socket")]
    Socket(InodeBlob),
}

impl SchemaBlob {
    /// Parse a blob's bytes as a schema blob. Unknown `camliType`
    /// values yield [`GateError::Unsupported`]; bytes that are not a
    /// JSON object with a `camliType` yield [`GateError::Corrupt`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| GateError::Corrupt(format!("not a schema blob: {e}")))?;
        let ty = value
            .get("camliType")
            .and_then(|t| t.as_str())
            .ok_or_else(|| GateError::Corrupt("schema blob without camliType".into()))?
            .to_string();
        match ty.as_str() {
            "file" | "directory" | "static-set" | "symlink" | "fifo" | "socket" => {
                serde_json::from_value(value)
                    .map_err(|e| GateError::Corrupt(format!("bad {ty} schema blob: {e}")))
            }
            other => Err(GateError::Unsupported(format!("camliType {other:?}"))),
        }
    }

    /// File name carried by the blob, when the variant has one.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::File(f) => Some(&f.file_name),
            Self::Directory(d) => Some(&d.file_name),
            Self::Symlink(s) => Some(&s.file_name),
            Self::Fifo(i) | Self::Socket(i) => Some(&i.file_name),
            Self::StaticSet(_) => None,
        }
    }
}

/// Metadata for a file upload, independent of where the bytes come from.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub name: String,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub mode: Option<u32>,
}

impl FileInfo {
    pub fn from_path_metadata(name: &str, meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            Some(meta.mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = None;
        Self {
            name: name.to_string(),
            mtime: meta.modified().ok(),
            ctime: meta.created().ok(),
            mode,
        }
    }
}

fn rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl FileBlob {
    /// A bare file blob with just a name; metadata added by setters.
    pub fn new(file_name: &str) -> Self {
        Self {
            camli_version: 1,
            file_name: base_name(file_name).to_string(),
            mime_type: None,
            unix_permission: None,
            unix_mtime: None,
            unix_ctime: None,
            parts: Vec::new(),
        }
    }

    /// Build from file metadata. When `cap_ctime` is set the creation
    /// time is forged down to the modification time if it is newer.
    pub fn from_info(info: &FileInfo, cap_ctime: bool) -> Self {
        let mut file = Self::new(&info.name);
        if let Some(mode) = info.mode {
            file.unix_permission = Some(format!("0{mode:o}"));
        }
        if let Some(mtime) = info.mtime {
            file.unix_mtime = Some(rfc3339(mtime));
        }
        if let Some(ctime) = info.ctime {
            let ctime = match (cap_ctime, info.mtime) {
                (true, Some(mtime)) if ctime > mtime => mtime,
                _ => ctime,
            };
            file.unix_ctime = Some(rfc3339(ctime));
        }
        file
    }

    pub fn with_mime_type(mut self, mime: &str) -> Self {
        if !mime.is_empty() {
            self.mime_type = Some(mime.to_string());
        }
        self
    }

    /// Sum of chunk sizes.
    pub fn size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    pub fn mode(&self) -> Option<u32> {
        self.unix_permission
            .as_deref()
            .and_then(|p| u32::from_str_radix(p.trim_start_matches('0'), 8).ok())
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        let raw = self.unix_mtime.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).into())
    }
}

/// Strip any directory components off a name.
fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Read from `r` until `buf` is full or the stream ends. Returns the
/// number of bytes placed in `buf`.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Chunk `r` into the store under `file`'s metadata and return the
/// content ref of the stored file blob.
///
/// A zero-length stream is rejected with [`GateError::FileEmpty`] before
/// anything touches the store.
pub async fn write_file_map<R>(store: &dyn BlobStore, mut file: FileBlob, mut r: R) -> Result<BlobRef>
where
    R: AsyncRead + Unpin + Send,
{
    let mut parts = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut r, &mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        let br = BlobRef::from_data(DEFAULT_HASH, chunk);
        store.receive(&br, chunk).await?;
        parts.push(BytesPart {
            blob_ref: br,
            size: n as u64,
        });
        if n < CHUNK_SIZE {
            break;
        }
    }
    if parts.is_empty() {
        return Err(GateError::FileEmpty);
    }
    file.parts = parts;
    let json = serde_json::to_vec(&SchemaBlob::File(file))?;
    let br = BlobRef::from_data(DEFAULT_HASH, &json);
    store.receive(&br, &json).await?;
    Ok(br)
}

/// Convenience wrapper: name only, no extra metadata.
pub async fn write_file_from_reader<R>(store: &dyn BlobStore, name: &str, r: R) -> Result<BlobRef>
where
    R: AsyncRead + Unpin + Send,
{
    write_file_map(store, FileBlob::new(name), r).await
}

/// Reader over a stored file blob. Chunks are loaded eagerly so that a
/// missing chunk surfaces as an error up front instead of mid-stream.
pub struct FileReader {
    blob_ref: BlobRef,
    file: FileBlob,
}

impl FileReader {
    /// Fetch `br` and parse it as a file schema blob.
    pub async fn open(store: &dyn BlobStore, br: &BlobRef) -> Result<Self> {
        let (data, _) = store.fetch(br).await?;
        match SchemaBlob::parse(&data)? {
            SchemaBlob::File(file) => Ok(Self {
                blob_ref: br.clone(),
                file,
            }),
            other => Err(GateError::Corrupt(format!(
                "{br} is a {} blob, not a file",
                match other {
                    SchemaBlob::Directory(_) => "directory",
                    SchemaBlob::StaticSet(_) => "static-set",
                    SchemaBlob::Symlink(_) => "symlink",
                    SchemaBlob::Fifo(_) => "fifo",
                    SchemaBlob::Socket(_) => "socket",
                    SchemaBlob::File(_) => unreachable!(),
                }
            ))),
        }
    }

    pub fn file(&self) -> &FileBlob {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Load every chunk and return the reassembled bytes. A file blob
    /// with no parts, a missing chunk, or a short chunk all mean the
    /// stored file is unusable.
    pub async fn read_all(&self, store: &dyn BlobStore) -> Result<Vec<u8>> {
        if self.file.parts.is_empty() {
            return Err(GateError::Corrupt(format!(
                "file blob {} has empty parts",
                self.blob_ref
            )));
        }
        let mut out = Vec::with_capacity(self.size() as usize);
        for part in &self.file.parts {
            let (chunk, _) = store.fetch(&part.blob_ref).await.map_err(|e| match e {
                GateError::NotFound(_) => GateError::Corrupt(format!(
                    "chunk {} of {} is missing",
                    part.blob_ref, self.blob_ref
                )),
                other => other,
            })?;
            if chunk.len() as u64 != part.size {
                return Err(GateError::Corrupt(format!(
                    "chunk {} of {}: got {} bytes, want {}",
                    part.blob_ref,
                    self.blob_ref,
                    chunk.len(),
                    part.size
                )));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
