//! MIME sniffing and the two-tier mime cache
//!
//! Sniffing looks at no more than the first 1 KiB of a stream and
//! matches it against a static magic table. The consumed prefix is
//! replayed in front of the rest of the stream, and a read error hit
//! during sniffing only surfaces once the caller reads past the prefix.
//!
//! The cache maps a ref's short key to its media type: a bounded LRU in
//! RAM backed write-through by a sled file. If the file cannot be
//! opened the cache degrades to RAM-only and keeps working.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::warn;

/// Sniffing never consumes more than this many bytes.
pub const SNIFF_LEN: usize = 1024;

/// Default size of the in-memory tier.
pub const DEFAULT_MAX_MEM_ENTRIES: usize = 1024;

/// Magic prefixes checked at offset 0, most specific first.
static MAGIC: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"%PDF-", "application/pdf"),
    (b"%!", "application/postscript"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
    (b"BZh", "application/x-bzip2"),
    (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (b"Rar!\x1a\x07", "application/x-rar-compressed"),
    (b"OggS", "application/ogg"),
    (b"fLaC", "audio/flac"),
    (b"ID3", "audio/mpeg"),
    (b"\x1aE\xdf\xa3", "video/webm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"<?xml", "application/xml"),
];

/// Detect a media type from the first bytes of a stream. Returns the
/// empty string when nothing matches.
pub fn sniff(data: &[u8]) -> &'static str {
    for (magic, mime) in MAGIC {
        if data.starts_with(magic) {
            return mime;
        }
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" {
        match &data[8..12] {
            b"WAVE" => return "audio/wav",
            b"WEBP" => return "image/webp",
            b"AVI " => return "video/x-msvideo",
            _ => {}
        }
    }
    if data.len() >= 8 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }
    let head = &data[..data.len().min(256)];
    let trimmed: Vec<u8> = head
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .collect();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return "text/html";
    }
    if !data.is_empty() && looks_textual(data) {
        return "text/plain; charset=utf-8";
    }
    ""
}

/// Keep `guess` when the caller already knows better; otherwise sniff.
pub fn match_mime(guess: &str, data: &[u8]) -> String {
    if !guess.is_empty() && guess != "application/octet-stream" {
        return guess.to_string();
    }
    sniff(data).to_string()
}

fn looks_textual(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(SNIFF_LEN)];
    if std::str::from_utf8(sample).is_err() {
        // a multi-byte rune may be cut at the sample edge; retry
        // without the last three bytes before giving up
        let len = sample.len().saturating_sub(3);
        if std::str::from_utf8(&sample[..len]).is_err() {
            return false;
        }
    }
    !sample
        .iter()
        .any(|&b| b < 0x09 || (b > 0x0d && b < 0x20 && b != 0x1b))
}

/// Replays a sniffed prefix, then a deferred sniff error (if any),
/// then the remainder of the original stream.
pub struct SniffedReader<R> {
    prefix: Vec<u8>,
    pos: usize,
    pending_err: Option<std::io::Error>,
    inner: R,
}

impl<R: AsyncRead + Unpin> AsyncRead for SniffedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = this.pending_err.take() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Sniff the media type off the head of `r`.
///
/// Reads at most [`SNIFF_LEN`] bytes, then hands back a reader that
/// yields the full original stream. A read error during sniffing is
/// deferred until the wrapper is read past the prefix.
pub async fn mime_type_from_reader<R>(mut r: R) -> (String, SniffedReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    let mut pending_err = None;
    let mut buf = [0u8; 256];
    while prefix.len() < SNIFF_LEN {
        let want = buf.len().min(SNIFF_LEN - prefix.len());
        match r.read(&mut buf[..want]).await {
            Ok(0) => break,
            Ok(n) => prefix.extend_from_slice(&buf[..n]),
            Err(e) => {
                pending_err = Some(e);
                break;
            }
        }
    }
    let mime = sniff(&prefix).to_string();
    (
        mime,
        SniffedReader {
            prefix,
            pos: 0,
            pending_err,
            inner: r,
        },
    )
}

/// Default on-disk cache path; the env pair keeps deployments sharing
/// one temp dir from trampling each other's cache files.
pub fn default_cache_path() -> PathBuf {
    let cus = std::env::var("BRUNO_CUS").unwrap_or_default();
    let env = std::env::var("BRUNO_ENV").unwrap_or_default();
    std::env::temp_dir().join(format!("mimecache-{cus}_{env}.kv"))
}

/// Write-through mime cache: bounded LRU in RAM, sled file behind it.
pub struct MimeCache {
    mem: Mutex<LruCache<String, String>>,
    db: Option<sled::Db>,
}

impl MimeCache {
    pub fn new(path: &Path, max_mem_entries: usize) -> Self {
        let max = if max_mem_entries == 0 {
            DEFAULT_MAX_MEM_ENTRIES
        } else {
            max_mem_entries
        };
        let db = match sled::open(path) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "mime cache degrading to RAM only");
                None
            }
        };
        Self {
            mem: Mutex::new(LruCache::new(
                NonZeroUsize::new(max).expect("max_mem_entries is nonzero"),
            )),
            db,
        }
    }

    /// RAM-only cache, for tests and degraded operation.
    pub fn in_memory(max_mem_entries: usize) -> Self {
        Self {
            mem: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_mem_entries.max(1)).expect("nonzero"),
            )),
            db: None,
        }
    }

    /// The stored media type for `key`, or empty.
    pub fn get(&self, key: &str) -> String {
        if let Some(mime) = self.mem.lock().get(key) {
            return mime.clone();
        }
        if let Some(db) = &self.db {
            if let Ok(Some(v)) = db.get(key.as_bytes()) {
                if let Ok(mime) = std::str::from_utf8(&v) {
                    self.mem.lock().put(key.to_string(), mime.to_string());
                    return mime.to_string();
                }
            }
        }
        String::new()
    }

    /// Store a media type. Empty types are ignored.
    pub fn set(&self, key: &str, mime: &str) {
        if mime.is_empty() {
            return;
        }
        self.mem.lock().put(key.to_string(), mime.to_string());
        if let Some(db) = &self.db {
            if let Err(e) = db.insert(key.as_bytes(), mime.as_bytes()) {
                warn!(key = key, mime = mime, error = %e, "persisting mime type");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn magic_table_matches() {
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n....."), "image/png");
        assert_eq!(sniff(b"\xff\xd8\xff\xe0 jpeg"), "image/jpeg");
        assert_eq!(sniff(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(sniff(b"\x00\x00\x00\x18ftypmp42"), "video/mp4");
        assert_eq!(sniff(b"  <!DOCTYPE HTML><html>"), "text/html");
        assert_eq!(sniff(b"plain old notes\n"), "text/plain; charset=utf-8");
        assert_eq!(sniff(&[0u8, 159, 146, 150]), "");
    }

    #[test]
    fn match_mime_prefers_caller_guess() {
        assert_eq!(match_mime("image/x-custom", b"%PDF-"), "image/x-custom");
        assert_eq!(
            match_mime("application/octet-stream", b"%PDF-"),
            "application/pdf"
        );
        assert_eq!(match_mime("", b"%PDF-"), "application/pdf");
    }

    #[tokio::test]
    async fn sniffed_reader_replays_whole_stream() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let (_, mut rd) = mime_type_from_reader(Cursor::new(data.clone())).await;
        let mut out = Vec::new();
        rd.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn sniff_stops_at_limit() {
        // inner reader fails past SNIFF_LEN: sniffing must not get there
        struct Limited {
            data: Vec<u8>,
            pos: usize,
        }
        impl AsyncRead for Limited {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                let this = self.get_mut();
                if this.pos >= SNIFF_LEN {
                    return Poll::Ready(Err(std::io::Error::other("read past sniff window")));
                }
                let n = buf.remaining().min(this.data.len() - this.pos).min(64);
                buf.put_slice(&this.data[this.pos..this.pos + n]);
                this.pos += n;
                Poll::Ready(Ok(()))
            }
        }
        let inner = Limited {
            data: vec![b'a'; SNIFF_LEN * 4],
            pos: 0,
        };
        let (mime, _) = mime_type_from_reader(inner).await;
        assert_eq!(mime, "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn sniff_error_is_deferred_past_prefix() {
        struct FailAfter {
            served: bool,
        }
        impl AsyncRead for FailAfter {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                let this = self.get_mut();
                if this.served {
                    return Poll::Ready(Err(std::io::Error::other("boom")));
                }
                this.served = true;
                buf.put_slice(b"some text before the failure");
                Poll::Ready(Ok(()))
            }
        }
        let (mime, mut rd) = mime_type_from_reader(FailAfter { served: false }).await;
        assert_eq!(mime, "text/plain; charset=utf-8");
        // the prefix reads fine
        let mut prefix = vec![0u8; 28];
        rd.read_exact(&mut prefix).await.unwrap();
        assert_eq!(&prefix, b"some text before the failure");
        // only now the error surfaces
        let mut rest = Vec::new();
        assert!(rd.read_to_end(&mut rest).await.is_err());
    }

    #[test]
    fn cache_set_get_and_ignores_empty() {
        let cache = MimeCache::in_memory(8);
        assert_eq!(cache.get("k"), "");
        cache.set("k", "image/png");
        assert_eq!(cache.get("k"), "image/png");
        cache.set("k2", "");
        assert_eq!(cache.get("k2"), "");
    }

    #[test]
    fn cache_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mime.kv");
        {
            let cache = MimeCache::new(&path, 8);
            cache.set("sticky", "application/pdf");
        }
        let cache = MimeCache::new(&path, 8);
        assert_eq!(cache.get("sticky"), "application/pdf");
    }

    #[test]
    fn unopenable_db_degrades_to_ram() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"occupied").unwrap();
        let cache = MimeCache::new(&file, 8);
        cache.set("k", "text/html");
        assert_eq!(cache.get("k"), "text/html");
    }
}
