//! sled-backed blob store
//!
//! Each blob is one row keyed as `prefix ++ binary(ref)`. The storage
//! generation lives under `prefix ++ "GENERATION"`; enumeration skips
//! any row whose key suffix does not parse as a ref.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::blobref::{BlobRef, SizedRef};
use crate::store::{verify_hash, BlobStore, Generation, StatFn};
use crate::types::{GateError, Result};

const GENERATION_KEY: &[u8] = b"GENERATION";

pub struct KvStore {
    db: sled::Db,
    prefix: Vec<u8>,
}

impl KvStore {
    /// Open (or create) a store at `root`. A store that fails to open
    /// is assumed damaged: the directory is wiped, recreated, and the
    /// open retried once before giving up.
    pub fn open(root: &Path, prefix: &str) -> Result<Self> {
        let db = match sled::open(root) {
            Ok(db) => db,
            Err(first) => {
                warn!(root = %root.display(), error = %first, "reopening store after wipe");
                let _ = std::fs::remove_dir_all(root);
                std::fs::create_dir_all(root)
                    .map_err(|e| GateError::StorageInit(format!("{}: {e}", root.display())))?;
                sled::open(root)
                    .map_err(|e| GateError::StorageInit(format!("{}: {e}", root.display())))?
            }
        };
        info!(root = %root.display(), prefix = prefix, "opened blob store");
        Ok(Self::managed(db, prefix))
    }

    /// Use an already-open sled database. The caller keeps ownership of
    /// the database lifecycle; this store only claims one key prefix.
    pub fn managed(db: sled::Db, prefix: &str) -> Self {
        Self {
            db,
            prefix: prefix.as_bytes().to_vec(),
        }
    }

    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("camgate-blobs")
    }

    fn key(&self, br: &BlobRef) -> Vec<u8> {
        let raw = br.to_bytes();
        let mut key = Vec::with_capacity(self.prefix.len() + raw.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&raw);
        key
    }

    fn generation_key(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(GENERATION_KEY);
        key
    }
}

#[async_trait]
impl BlobStore for KvStore {
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        match self.db.get(self.key(br))? {
            Some(v) => Ok((v.to_vec(), v.len() as u32)),
            None => Err(GateError::NotFound(br.to_string())),
        }
    }

    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        verify_hash(br, data)?;
        self.db.insert(self.key(br), data)?;
        Ok(SizedRef {
            blob_ref: br.clone(),
            size: data.len() as u32,
        })
    }

    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        for br in refs {
            if let Some(v) = self.db.get(self.key(br))? {
                f(SizedRef {
                    blob_ref: br.clone(),
                    size: v.len() as u32,
                });
            }
        }
        Ok(())
    }

    async fn enumerate(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
        dest: mpsc::Sender<SizedRef>,
    ) -> Result<()> {
        let after_key = after.map(|br| self.key(br));
        let mut sent = 0;
        for row in self.db.scan_prefix(&self.prefix) {
            let (key, value) = row?;
            if let Some(ref ak) = after_key {
                if key.as_ref() <= ak.as_slice() {
                    continue;
                }
            }
            let suffix = &key.as_ref()[self.prefix.len()..];
            let br = match BlobRef::from_bytes(suffix) {
                Ok(br) => br,
                // the GENERATION row, or junk left by another version
                Err(_) => continue,
            };
            if dest
                .send(SizedRef {
                    blob_ref: br,
                    size: value.len() as u32,
                })
                .await
                .is_err()
            {
                break;
            }
            sent += 1;
            if limit != 0 && sent >= limit {
                break;
            }
        }
        Ok(())
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        for br in refs {
            self.db.remove(self.key(br))?;
        }
        Ok(())
    }

    async fn generation(&self) -> Result<Generation> {
        match self.db.get(self.generation_key())? {
            Some(v) => Ok(serde_json::from_slice(&v)?),
            None => Err(GateError::NotFound("generation".into())),
        }
    }

    async fn reset_generation(&self) -> Result<Generation> {
        let gen = Generation::new();
        self.db
            .insert(self.generation_key(), serde_json::to_vec(&gen)?)?;
        Ok(gen)
    }
}
