//! Read path: refs to bytes, refs to filesystem trees
//!
//! Fetches ride a read-through permanent cache in front of the remote
//! store. When a direct fetch fails for any reason other than plain
//! absence, the external `pk-get` (or legacy `camget`) CLI is tried as
//! a fallback before giving up. `save` materialises whole schema
//! subtrees onto the local filesystem, expanding static-sets with a
//! small worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::blobref::BlobRef;
use crate::percache::{CachingFetcher, PerCache, PerCacheConfig};
use crate::schema::{FileReader, SchemaBlob};
use crate::store::{BlobStore, KvStore, RemoteStore};
use crate::types::{GateError, Result};

/// Worker count for static-set expansion.
const SAVE_WORKERS: usize = 10;

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub server: String,
    pub insecure_tls: bool,
    /// Skip symlinks, fifos and sockets when materialising trees.
    pub skip_irregular: bool,
    /// Root directory for the permanent cache; a per-server directory
    /// under the OS temp dir when unset.
    pub cache_root: Option<PathBuf>,
}

impl DownloaderConfig {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            insecure_tls: false,
            skip_irregular: false,
            cache_root: None,
        }
    }
}

pub struct Downloader {
    server: String,
    fetcher: Arc<dyn BlobStore>,
    insecure_tls: bool,
    skip_irregular: bool,
}

fn lookup_in_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|p| p.join(name).is_file())
}

/// `pk-get`, falling back to the legacy `camget` name.
pub fn get_command() -> &'static str {
    static CMD: OnceLock<&'static str> = OnceLock::new();
    CMD.get_or_init(|| {
        if !lookup_in_path("pk-get") && lookup_in_path("camget") {
            "camget"
        } else {
            "pk-get"
        }
    })
}

fn cache_root_for(server: &str) -> PathBuf {
    let tag = hex::encode(&crate::blobref::BlobRef::from_data(
        crate::blobref::HashAlgo::Sha1,
        server.as_bytes(),
    )
    .digest()[..6]);
    std::env::temp_dir().join(format!("camgate-cache-{tag}"))
}

impl Downloader {
    pub fn new(cfg: DownloaderConfig) -> Result<Arc<Self>> {
        let fetcher: Arc<dyn BlobStore> = match cfg.server.strip_prefix("file://") {
            Some(path) => Arc::new(KvStore::open(Path::new(path), "")?),
            None => {
                let remote: Arc<dyn BlobStore> =
                    Arc::new(RemoteStore::new(&cfg.server, cfg.insecure_tls)?);
                let root = cfg
                    .cache_root
                    .clone()
                    .unwrap_or_else(|| cache_root_for(&cfg.server));
                let cache = PerCache::open(PerCacheConfig::new(root))?;
                cache.spawn_maintenance(std::time::Duration::from_secs(15));
                Arc::new(CachingFetcher::new(cache, remote))
            }
        };
        let server = cfg.server.clone();
        Ok(Self::with_fetcher(&server, fetcher, cfg))
    }

    /// Build around an explicit fetcher; used by the registry and tests.
    pub fn with_fetcher(
        server: &str,
        fetcher: Arc<dyn BlobStore>,
        cfg: DownloaderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            server: server.to_string(),
            fetcher,
            insecure_tls: cfg.insecure_tls,
            skip_irregular: cfg.skip_irregular,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn fetcher(&self) -> &Arc<dyn BlobStore> {
        &self.fetcher
    }

    /// Produce the bytes for each ref, concatenated: the raw blob, or
    /// the reassembled file contents when `contents` is set and the
    /// blob is a file schema.
    pub async fn start(&self, contents: bool, refs: &[BlobRef]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for br in refs {
            match self.fetch_one(contents, br).await {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e @ GateError::NotFound(_)) => return Err(e),
                Err(e) => {
                    warn!(blob = %br, error = %e, "direct fetch failed, trying CLI");
                    out.extend_from_slice(&self.cli_get(contents, br).await?);
                }
            }
        }
        Ok(out)
    }

    async fn fetch_one(&self, contents: bool, br: &BlobRef) -> Result<Vec<u8>> {
        let (data, _) = self.fetcher.fetch(br).await?;
        if !contents {
            return Ok(data);
        }
        match SchemaBlob::parse(&data) {
            Ok(SchemaBlob::File(_)) => {
                let fr = FileReader::open(self.fetcher.as_ref(), br).await?;
                fr.read_all(self.fetcher.as_ref()).await
            }
            // not a file schema blob: hand back the raw bytes
            _ => Ok(data),
        }
    }

    /// Shell out to the download CLI and return its stdout.
    async fn cli_get(&self, contents: bool, br: &BlobRef) -> Result<Vec<u8>> {
        let mut cmd = Command::new(get_command());
        if !self.server.is_empty() {
            cmd.arg(format!("-server={}", self.server));
        }
        cmd.arg(format!("-contents={contents}"));
        cmd.arg(format!("-insecure={}", self.insecure_tls));
        cmd.arg(br.to_string());
        cmd.kill_on_drop(true);
        debug!(cmd = get_command(), blob = %br, "invoking download CLI");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(GateError::Downstream(format!(
                "{} {br}: {}",
                get_command(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Materialise each ref under `dest_dir`: files, directory trees,
    /// symlinks and friends, per the schema union.
    pub async fn save(&self, dest_dir: &Path, _contents: bool, refs: &[BlobRef]) -> Result<()> {
        tokio::fs::create_dir_all(dest_dir).await?;
        for br in refs {
            self.materialize(dest_dir.to_path_buf(), br.clone()).await?;
        }
        Ok(())
    }

    fn materialize(&self, dest: PathBuf, br: BlobRef) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let (data, _) = self.fetcher.fetch(&br).await?;
            let blob = match SchemaBlob::parse(&data) {
                Ok(blob) => blob,
                Err(GateError::Corrupt(_)) => {
                    // opaque data: just write the bytes out
                    let target = dest.join(br.to_string());
                    debug!(blob = %br, target = %target.display(), "writing opaque blob");
                    tokio::fs::write(&target, &data).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match blob {
                SchemaBlob::File(file) => {
                    let name = dest.join(&file.file_name);
                    let fr = FileReader::open(self.fetcher.as_ref(), &br).await?;
                    if let Ok(meta) = tokio::fs::metadata(&name).await {
                        if meta.len() == fr.size() {
                            debug!(file = %name.display(), "skipping, already exists");
                            return Ok(());
                        }
                    }
                    let bytes = fr.read_all(self.fetcher.as_ref()).await?;
                    tokio::fs::write(&name, &bytes).await?;
                    set_file_meta(&name, file.mode(), file.mtime());
                    Ok(())
                }
                SchemaBlob::Directory(d) => {
                    let dir = dest.join(&d.file_name);
                    info!(blob = %br, dir = %dir.display(), "materialising directory");
                    tokio::fs::create_dir_all(&dir).await?;
                    let mode = d
                        .unix_permission
                        .as_deref()
                        .and_then(|p| u32::from_str_radix(p.trim_start_matches('0'), 8).ok());
                    set_file_meta(&dir, mode, None);
                    self.materialize(dir, d.entries).await
                }
                SchemaBlob::StaticSet(set) => {
                    let results: Vec<Result<()>> = stream::iter(set.members)
                        .map(|member| self.materialize(dest.clone(), member))
                        .buffer_unordered(SAVE_WORKERS)
                        .collect()
                        .await;
                    results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
                }
                SchemaBlob::Symlink(link) => {
                    if self.skip_irregular {
                        return Ok(());
                    }
                    let name = dest.join(&link.file_name);
                    if tokio::fs::symlink_metadata(&name).await.is_ok() {
                        debug!(link = %name.display(), "skipping, already exists");
                        return Ok(());
                    }
                    if link.symlink_target.is_empty() {
                        return Err(GateError::Corrupt(format!("symlink {br} without target")));
                    }
                    #[cfg(unix)]
                    tokio::fs::symlink(&link.symlink_target, &name).await?;
                    #[cfg(not(unix))]
                    warn!(link = %name.display(), "skipping symlink: unsupported platform");
                    Ok(())
                }
                SchemaBlob::Fifo(node) | SchemaBlob::Socket(node) => {
                    if self.skip_irregular {
                        return Ok(());
                    }
                    // no portable way to create these; skip with a note
                    warn!(name = %node.file_name, "skipping irregular file: unsupported file type");
                    Ok(())
                }
            }
        })
    }
}

fn set_file_meta(path: &Path, mode: Option<u32>, mtime: Option<std::time::SystemTime>) {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %e, "chmod");
        }
    }
    if let Some(mtime) = mtime {
        let times = std::fs::FileTimes::new().set_modified(mtime);
        let res = std::fs::File::options()
            .write(true)
            .open(path)
            .and_then(|f| f.set_times(times));
        if let Err(e) = res {
            debug!(path = %path.display(), error = %e, "chtimes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{self, StaticSetBlob};
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn test_downloader(store: Arc<MemoryStore>) -> Arc<Downloader> {
        Downloader::with_fetcher(
            "http://unit.test",
            store,
            DownloaderConfig::new("http://unit.test"),
        )
    }

    #[tokio::test]
    async fn start_returns_raw_schema_json() {
        let store = Arc::new(MemoryStore::new());
        let br = schema::write_file_from_reader(store.as_ref(), "a.txt", &b"abc"[..])
            .await
            .unwrap();
        let down = test_downloader(Arc::clone(&store));

        let raw = down.start(false, std::slice::from_ref(&br)).await.unwrap();
        let parsed = SchemaBlob::parse(&raw).unwrap();
        assert!(matches!(parsed, SchemaBlob::File(_)));
    }

    #[tokio::test]
    async fn start_reassembles_contents() {
        let store = Arc::new(MemoryStore::new());
        let data = vec![9u8; 70_000]; // spans two chunks
        let br = schema::write_file_from_reader(store.as_ref(), "big", &data[..])
            .await
            .unwrap();
        let down = test_downloader(Arc::clone(&store));
        let got = down.start(true, std::slice::from_ref(&br)).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn start_concatenates_refs() {
        let store = Arc::new(MemoryStore::new());
        let a = schema::write_file_from_reader(store.as_ref(), "a", &b"one"[..])
            .await
            .unwrap();
        let b = schema::write_file_from_reader(store.as_ref(), "b", &b"two"[..])
            .await
            .unwrap();
        let down = test_downloader(Arc::clone(&store));
        let got = down.start(true, &[a, b]).await.unwrap();
        assert_eq!(got, b"onetwo");
    }

    #[tokio::test]
    async fn missing_ref_surfaces_not_found() {
        let store = Arc::new(MemoryStore::new());
        let down = test_downloader(store);
        let br = BlobRef::from_data(crate::blobref::HashAlgo::Sha224, b"absent");
        assert!(matches!(
            down.start(false, &[br]).await.unwrap_err(),
            GateError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn save_materialises_file() {
        let store = Arc::new(MemoryStore::new());
        let br = schema::write_file_from_reader(store.as_ref(), "notes.txt", &b"saved bytes"[..])
            .await
            .unwrap();
        let down = test_downloader(Arc::clone(&store));
        let dir = TempDir::new().unwrap();
        down.save(dir.path(), true, std::slice::from_ref(&br))
            .await
            .unwrap();
        let written = std::fs::read(dir.path().join("notes.txt")).unwrap();
        assert_eq!(written, b"saved bytes");

        // idempotent: same size file left in place
        down.save(dir.path(), true, std::slice::from_ref(&br))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_expands_static_set() {
        let store = Arc::new(MemoryStore::new());
        let mut members = Vec::new();
        for i in 0..20u32 {
            let br = schema::write_file_from_reader(
                store.as_ref(),
                &format!("member-{i}.txt"),
                format!("content {i}").as_bytes(),
            )
            .await
            .unwrap();
            members.push(br);
        }
        let set = SchemaBlob::StaticSet(StaticSetBlob {
            camli_version: 1,
            members,
        });
        let json = serde_json::to_vec(&set).unwrap();
        let set_ref = BlobRef::from_data(crate::blobref::DEFAULT_HASH, &json);
        store.receive(&set_ref, &json).await.unwrap();

        let down = test_downloader(Arc::clone(&store));
        let dir = TempDir::new().unwrap();
        down.save(dir.path(), true, &[set_ref]).await.unwrap();
        for i in 0..20u32 {
            let got = std::fs::read(dir.path().join(format!("member-{i}.txt"))).unwrap();
            assert_eq!(got, format!("content {i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn save_skips_irregular_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let link = SchemaBlob::Symlink(crate::schema::SymlinkBlob {
            camli_version: 1,
            file_name: "lnk".into(),
            symlink_target: "/etc/hosts".into(),
        });
        let json = serde_json::to_vec(&link).unwrap();
        let br = BlobRef::from_data(crate::blobref::DEFAULT_HASH, &json);
        store.receive(&br, &json).await.unwrap();

        let mut cfg = DownloaderConfig::new("http://unit.test");
        cfg.skip_irregular = true;
        let down = Downloader::with_fetcher("http://unit.test", store, cfg);
        let dir = TempDir::new().unwrap();
        down.save(dir.path(), true, &[br]).await.unwrap();
        assert!(std::fs::symlink_metadata(dir.path().join("lnk")).is_err());
    }
}
