//! Write path: chunk streams into the store, verify, attach permanodes
//!
//! Direct writes go through the schema file writer straight into the
//! store adapter. Permanode and claim blobs need a signer, which only
//! the external `pk-put` (or legacy `camput`) CLI carries, so those and
//! non-regular paths shell out. Every long-running entry point passes
//! through a counting semaphore so a burst of uploads cannot swamp the
//! chunker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::blobref::BlobRef;
use crate::mime;
use crate::schema::{self, FileBlob, FileInfo, FileReader};
use crate::store::{BlobStore, KvStore, RemoteStore};
use crate::types::{GateError, Result};

/// Attribute names with this prefix are reserved for the schema layer
/// and filtered out of caller-supplied permanode attributes.
pub const RESERVED_ATTR_PREFIX: &str = "camli";

const VERIFY_ATTEMPTS: u32 = 10;
const VERIFY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub server: String,
    /// Forge ctime down to mtime on file blobs.
    pub cap_ctime: bool,
    /// Skip the CLI's on-disk have-cache (more load on the server, but
    /// CLI calls no longer need to serialize).
    pub skip_have_cache: bool,
    pub insecure_tls: bool,
    /// Concurrent chunking permits; 0 means one per CPU.
    pub gate_permits: usize,
}

impl UploaderConfig {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            cap_ctime: false,
            skip_have_cache: false,
            insecure_tls: false,
            gate_permits: 0,
        }
    }
}

pub struct Uploader {
    server: String,
    store: Arc<dyn BlobStore>,
    gate: Semaphore,
    /// Serializes CLI invocations that share the on-disk have-cache.
    cli_mutex: Mutex<()>,
    cli_opts: Vec<String>,
    cli_debug_env: bool,
    skip_have_cache: bool,
    cap_ctime: bool,
}

fn default_gate_permits() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn lookup_in_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|p| p.join(name).is_file())
}

/// `pk-put`, falling back to the legacy `camput` name.
pub fn put_command() -> &'static str {
    static CMD: OnceLock<&'static str> = OnceLock::new();
    CMD.get_or_init(|| {
        if !lookup_in_path("pk-put") && lookup_in_path("camput") {
            "camput"
        } else {
            "pk-put"
        }
    })
}

/// Drop attributes whose name starts with `skip_prefix`.
pub fn filter_attrs(
    skip_prefix: &str,
    attrs: &HashMap<String, String>,
) -> HashMap<String, String> {
    attrs
        .iter()
        .filter(|(k, _)| !k.starts_with(skip_prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Uploader {
    pub fn new(cfg: UploaderConfig) -> Result<Arc<Self>> {
        let (store, skip_have_cache): (Arc<dyn BlobStore>, bool) =
            match cfg.server.strip_prefix("file://") {
                // a local store needs no CLI and no have-cache
                Some(path) => (Arc::new(KvStore::open(Path::new(path), "")?), true),
                None => (
                    Arc::new(RemoteStore::new(&cfg.server, cfg.insecure_tls)?),
                    cfg.skip_have_cache,
                ),
            };
        Ok(Self::with_store(store, cfg, skip_have_cache))
    }

    /// Build around an explicit store; used by the registry and tests.
    pub fn with_store(
        store: Arc<dyn BlobStore>,
        cfg: UploaderConfig,
        skip_have_cache: bool,
    ) -> Arc<Self> {
        let mut cli_opts = Vec::new();
        let mut cli_debug_env = false;
        if skip_have_cache {
            cli_opts.push("-havecache=false".to_string());
            cli_opts.push("-statcache=false".to_string());
            cli_debug_env = true;
        }
        if cfg.cap_ctime {
            // -capctime is a debug-only flag in the CLI
            cli_opts.push("-capctime".to_string());
            cli_debug_env = true;
        }
        let permits = if cfg.gate_permits == 0 {
            default_gate_permits()
        } else {
            cfg.gate_permits
        };
        Arc::new(Self {
            server: cfg.server,
            store,
            gate: Semaphore::new(permits),
            cli_mutex: Mutex::new(()),
            cli_opts,
            cli_debug_env,
            skip_have_cache,
            cap_ctime: cfg.cap_ctime,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.gate.acquire().await.map_err(|_| GateError::Cancelled)
    }

    /// Chunk a stream into the store under `name`, defaulting all other
    /// file metadata.
    pub async fn upload_reader<R>(&self, name: &str, r: R) -> Result<BlobRef>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _permit = self.acquire().await?;
        schema::write_file_from_reader(self.store.as_ref(), name, r).await
    }

    /// Chunk a stream carrying the given file metadata and MIME type.
    pub async fn upload_reader_info<R>(&self, info: &FileInfo, mime_type: &str, r: R) -> Result<BlobRef>
    where
        R: AsyncRead + Unpin + Send,
    {
        let file = FileBlob::from_info(info, self.cap_ctime).with_mime_type(mime_type);
        let _permit = self.acquire().await?;
        schema::write_file_map(self.store.as_ref(), file, r).await
    }

    /// Upload a path. Regular files are written directly; anything else
    /// is delegated to the external CLI. Returns the content ref and,
    /// when asked for, the permanode ref.
    pub async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        permanode: bool,
    ) -> Result<(BlobRef, Option<BlobRef>)> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return self.upload_file_ext(path, permanode).await;
        }
        let content = self.upload_file_verified(path, mime_type).await?;
        if !permanode {
            return Ok((content, None));
        }
        let perma = self.attach_permanode(&content, &HashMap::new()).await?;
        Ok((content, Some(perma)))
    }

    /// Like [`upload_file`](Self::upload_file), but a permanode is
    /// created only when `attrs` carries at least one non-reserved key.
    /// Permanode creation and attribute claims are best-effort: their
    /// failure is logged, not returned.
    pub async fn upload_file_lazy_attr(
        &self,
        path: &Path,
        mime_type: &str,
        attrs: &HashMap<String, String>,
    ) -> Result<(BlobRef, Option<BlobRef>)> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return self.upload_file_ext_lazy_attr(path, attrs).await;
        }
        let filtered = filter_attrs(RESERVED_ATTR_PREFIX, attrs);
        let content = self.upload_file_verified(path, mime_type).await?;
        if filtered.is_empty() {
            return Ok((content, None));
        }
        match self.attach_permanode(&content, &filtered).await {
            Ok(perma) => Ok((content, Some(perma))),
            Err(e) => {
                warn!(content = %content, error = %e, "permanode creation failed");
                Ok((content, None))
            }
        }
    }

    /// Direct write of a regular file, with the write-back check: the
    /// chunker can emit a file blob with empty `parts` when the store
    /// is under load, so the fresh content ref is fetched back and its
    /// parts checked, retrying the whole write up to a fixed ceiling.
    async fn upload_file_verified(&self, path: &Path, mime_type: &str) -> Result<BlobRef> {
        // zero-length uploads are rejected before any store interaction
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() == 0 {
            return Err(GateError::FileEmpty);
        }
        let mut last_err = None;
        for attempt in 1..=VERIFY_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(VERIFY_BASE_DELAY * (attempt - 1)).await;
            }
            match self.upload_file_mime(path, mime_type).await {
                Ok(content) => match self.verify_file_blob(&content).await {
                    Ok(()) => return Ok(content),
                    Err(e @ GateError::Corrupt(_)) => {
                        warn!(path = %path.display(), attempt, error = %e, "upload verification failed");
                        last_err = Some(e);
                    }
                    Err(other) => return Err(other),
                },
                Err(e @ GateError::FileEmpty) => {
                    warn!(path = %path.display(), attempt, "file empty, retrying");
                    last_err = Some(e);
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or(GateError::EmptyResponse))
    }

    /// Fetch a content ref back and require a file blob with parts.
    async fn verify_file_blob(&self, content: &BlobRef) -> Result<()> {
        let fr = FileReader::open(self.store.as_ref(), content).await?;
        if fr.file().parts.is_empty() {
            return Err(GateError::Corrupt(format!("blob[{content}].parts is empty")));
        }
        Ok(())
    }

    /// Upload one regular file, sniffing the MIME type if the caller
    /// did not supply a usable one.
    async fn upload_file_mime(&self, path: &Path, mime_type: &str) -> Result<BlobRef> {
        let fh = tokio::fs::File::open(path).await?;
        let meta = fh.metadata().await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let info = FileInfo::from_path_metadata(&name, &meta);

        let _permit = self.acquire().await?;
        if mime_type.is_empty() || mime_type == "application/octet-stream" {
            let (sniffed, rd) = mime::mime_type_from_reader(fh).await;
            let file = FileBlob::from_info(&info, self.cap_ctime).with_mime_type(&sniffed);
            schema::write_file_map(self.store.as_ref(), file, rd).await
        } else {
            let file = FileBlob::from_info(&info, self.cap_ctime).with_mime_type(mime_type);
            schema::write_file_map(self.store.as_ref(), file, fh).await
        }
    }

    /// Create a permanode and claim `camliContent` plus the given
    /// attributes onto it. `attrs` must already be filtered.
    async fn attach_permanode(
        &self,
        content: &BlobRef,
        attrs: &HashMap<String, String>,
    ) -> Result<BlobRef> {
        let refs = self.run_put_cli("permanode", &[], None).await?;
        let perma = refs
            .first()
            .cloned()
            .ok_or(GateError::EmptyResponse)?;
        let mut all = attrs.clone();
        all.insert("camliContent".to_string(), content.to_string());
        self.set_permanode_attrs(&perma, &all).await?;
        Ok(perma)
    }

    /// Claim attributes onto a permanode, one claim blob per attribute.
    /// Claims are never retried; a duplicated claim changes semantics.
    pub async fn set_permanode_attrs(
        &self,
        perma: &BlobRef,
        attrs: &HashMap<String, String>,
    ) -> Result<()> {
        let perma_str = perma.to_string();
        for (k, v) in attrs {
            let args = [perma_str.as_str(), k.as_str(), v.as_str()];
            if let Err(e) = self.run_put_cli("attr", &args, None).await {
                warn!(perma = %perma, key = k, error = %e, "setting permanode attribute");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Upload a non-regular path (directory tree) via the CLI.
    async fn upload_file_ext(
        &self,
        path: &Path,
        permanode: bool,
    ) -> Result<(BlobRef, Option<BlobRef>)> {
        info!(path = %path.display(), permanode, "delegating upload to CLI");
        let meta = tokio::fs::metadata(path).await?;
        if meta.is_file() && meta.len() == 0 {
            return Err(GateError::FileEmpty);
        }
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let dir = path.parent().map(|p| p.to_path_buf());
        let mut args: Vec<&str> = vec![base.as_str()];
        if permanode {
            args.push("--permanode");
        }
        let refs = self.run_put_cli("file", &args, dir.as_deref()).await?;
        // first line is the content, last is the permanode
        let content = refs.first().cloned().ok_or(GateError::EmptyResponse)?;
        let perma = if refs.len() > 1 { refs.last().cloned() } else { None };
        Ok((content, perma))
    }

    async fn upload_file_ext_lazy_attr(
        &self,
        path: &Path,
        attrs: &HashMap<String, String>,
    ) -> Result<(BlobRef, Option<BlobRef>)> {
        let filtered = filter_attrs(RESERVED_ATTR_PREFIX, attrs);
        let (content, perma) = self.upload_file_ext(path, !filtered.is_empty()).await?;
        if let Some(ref perma) = perma {
            if let Err(e) = self.set_permanode_attrs(perma, &filtered).await {
                warn!(perma = %perma, error = %e, "setting attributes on CLI permanode");
            }
        }
        Ok((content, perma))
    }

    /// Invoke `pk-put <mode> ...`, parsing one ref per stdout line.
    /// File uploads get the same write-back verification as direct
    /// writes; permanode and claim modes run exactly once.
    async fn run_put_cli(
        &self,
        mode: &str,
        mode_args: &[&str],
        dir: Option<&Path>,
    ) -> Result<Vec<BlobRef>> {
        let _permit = self.acquire().await?;
        let attempts = if mode == "file" { VERIFY_ATTEMPTS } else { 1 };
        let mut last_err = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(VERIFY_BASE_DELAY * (attempt - 1)).await;
            }
            let refs = match self.run_put_cli_once(mode, mode_args, dir).await {
                Ok(refs) => refs,
                Err(e) => {
                    warn!(mode, attempt, error = %e, "CLI invocation failed");
                    last_err = Some(e);
                    continue;
                }
            };
            if refs.is_empty() {
                return Err(GateError::EmptyResponse);
            }
            if mode != "file" {
                return Ok(refs);
            }
            match self.verify_file_blob(&refs[0]).await {
                Ok(()) => return Ok(refs),
                Err(e @ GateError::Corrupt(_)) => {
                    warn!(content = %refs[0], attempt, error = %e, "CLI upload verification failed");
                    last_err = Some(e);
                }
                // verification is best-effort when the fetch path is down
                Err(e) => {
                    warn!(content = %refs[0], error = %e, "cannot verify CLI upload");
                    return Ok(refs);
                }
            }
        }
        Err(last_err.unwrap_or(GateError::EmptyResponse))
    }

    async fn run_put_cli_once(
        &self,
        mode: &str,
        mode_args: &[&str],
        dir: Option<&Path>,
    ) -> Result<Vec<BlobRef>> {
        let mut cmd = Command::new(put_command());
        if !self.server.is_empty() {
            cmd.arg(format!("-server={}", self.server));
        }
        cmd.arg(mode);
        cmd.args(&self.cli_opts);
        cmd.args(mode_args);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        if self.cli_debug_env {
            cmd.env("CAMLI_DEBUG", "true");
        }
        cmd.kill_on_drop(true);
        debug!(cmd = put_command(), mode, "invoking upload CLI");

        let output = if self.skip_have_cache {
            cmd.output().await?
        } else {
            // the CLI's have-cache file is not safe for concurrent use
            let _guard = self.cli_mutex.lock().await;
            cmd.output().await?
        };
        if !output.status.success() {
            return Err(GateError::Downstream(format!(
                "{} {mode}: {}",
                put_command(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let mut refs = Vec::new();
        for line in output.stdout.split(|&b| b == b'\n') {
            let line = std::str::from_utf8(line).unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(br) = BlobRef::parse(line) {
                refs.push(br);
            }
        }
        Ok(refs)
    }
}

/// Mirror path for an uploaded file: two directory levels derived from
/// the hex digest, then `<canonical ref>.dat`.
pub fn paranoid_path(root: &Path, br: &BlobRef) -> Option<PathBuf> {
    if !br.is_valid() {
        return None;
    }
    let txt = br.to_string();
    let (_, hsh) = txt.split_once('-')?;
    if hsh.len() < 6 {
        return None;
    }
    Some(root.join(&hsh[..3]).join(&hsh[3..6]).join(format!("{txt}.dat")))
}

/// Hard-link `src` to `dst`, falling back to a byte copy on
/// filesystems without link support.
pub fn link_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dst)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn test_uploader(store: Arc<MemoryStore>) -> Arc<Uploader> {
        Uploader::with_store(store, UploaderConfig::new("http://unit.test"), true)
    }

    #[tokio::test]
    async fn upload_reader_stores_file_blob() {
        let store = Arc::new(MemoryStore::new());
        let up = test_uploader(Arc::clone(&store));
        let content = up
            .upload_reader("greeting.txt", &b"hello camgate"[..])
            .await
            .unwrap();
        let fr = FileReader::open(store.as_ref(), &content).await.unwrap();
        assert_eq!(fr.file().file_name, "greeting.txt");
        assert_eq!(fr.read_all(store.as_ref()).await.unwrap(), b"hello camgate");
    }

    #[tokio::test]
    async fn upload_file_verifies_parts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("u.bin");
        std::fs::write(&path, vec![3u8; 2048]).unwrap();

        let store = Arc::new(MemoryStore::new());
        let up = test_uploader(Arc::clone(&store));
        let (content, perma) = up.upload_file(&path, "", false).await.unwrap();
        assert!(perma.is_none());

        let fr = FileReader::open(store.as_ref(), &content).await.unwrap();
        assert!(!fr.file().parts.is_empty());
        assert_eq!(fr.size(), 2048);
    }

    #[tokio::test]
    async fn upload_reader_info_carries_mime() {
        let store = Arc::new(MemoryStore::new());
        let up = test_uploader(Arc::clone(&store));
        let info = FileInfo {
            name: "page.html".into(),
            ..FileInfo::default()
        };
        let content = up
            .upload_reader_info(&info, "text/html", &b"<html></html>"[..])
            .await
            .unwrap();
        let fr = FileReader::open(store.as_ref(), &content).await.unwrap();
        assert_eq!(fr.file().mime_type.as_deref(), Some("text/html"));
    }

    #[test]
    fn filter_attrs_drops_reserved() {
        let mut attrs = HashMap::new();
        attrs.insert("title".to_string(), "t".to_string());
        attrs.insert("camliContent".to_string(), "x".to_string());
        attrs.insert("camliRoot".to_string(), "y".to_string());
        let filtered = filter_attrs(RESERVED_ATTR_PREFIX, &attrs);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("title"));
    }

    #[test]
    fn paranoid_path_layout() {
        let br = BlobRef::parse("sha1-f6c7ce14e91c5013368a0a3c3c24bd696778d823").unwrap();
        let p = paranoid_path(Path::new("/mirror"), &br).unwrap();
        assert_eq!(
            p,
            Path::new("/mirror/f6c/7ce/sha1-f6c7ce14e91c5013368a0a3c3c24bd696778d823.dat")
        );
    }

    #[test]
    fn link_or_copy_copies() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.dat");
        std::fs::write(&src, b"mirrored").unwrap();
        let dst = dir.path().join("a/b/dst.dat");
        link_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"mirrored");
    }
}
