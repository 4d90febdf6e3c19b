//! HTTP server implementation
//!
//! hyper http1 with TokioIo for async handling. The surface is small:
//! `GET /<ref>` streams a blob (or its schema JSON with `raw=1`) and
//! `POST /` ingests uploads, multipart or direct. Content-Type on the
//! way out goes through a writer that refuses to commit headers before
//! it has either 1 KiB to sniff or the whole body.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyDataStream, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthCheck, REALM};
use crate::blobref::BlobRef;
use crate::config::Args;
use crate::mime::{self, MimeCache};
use crate::registry::Registry;
use crate::types::{GateError, Result};
use crate::upload::{link_or_copy, paranoid_path, Uploader};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub registry: Registry,
    pub mime_cache: MimeCache,
    pub auth: Option<AuthCheck>,
}

impl AppState {
    pub fn new(args: Args, auth: Option<AuthCheck>) -> Self {
        let mime_path = args
            .mime_cache_path
            .clone()
            .unwrap_or_else(mime::default_cache_path);
        let registry = Registry::new(args.registry_config());
        Self {
            args,
            registry,
            mime_cache: MimeCache::new(&mime_path, 0),
            auth,
        }
    }
}

/// Start the HTTP server on the configured listen address.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!(
        listen = %state.args.listen,
        server = %state.args.server,
        "camgate listening"
    );
    serve_listener(state, listener).await
}

/// Serve connections from an already-bound listener.
pub async fn serve_listener(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    serve_connection(state, stream, addr).await;
                });
            }
            Err(e) => {
                error!(error = %e, "accepting connection");
            }
        }
    }
}

async fn serve_connection(state: Arc<AppState>, stream: TcpStream, addr: SocketAddr) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(state, addr, req).await }
    });
    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!(addr = %addr, error = %e, "connection ended");
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(addr = %addr, method = %method, path = %path, "request");

    if let Some(auth) = &state.auth {
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !auth.allows(header) {
            return Ok(unauthorized_response());
        }
    }

    let response = match method {
        Method::GET => handle_get(state, req).await,
        Method::POST => handle_post(state, req).await,
        _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method must be GET/POST"),
    };
    Ok(response)
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn query_value<'a>(values: &'a [(String, String)], key: &str) -> Option<&'a str> {
    values
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// GET /<ref>: the blob's file contents, or its schema JSON with raw=1.
async fn handle_get(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let name = path.trim_start_matches('/');
    if name.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "a blobref is needed!");
    }
    let br = match BlobRef::parse_any(name) {
        Ok(br) => br,
        Err(e) => return error_response(&e),
    };
    let values = parse_query(req.uri().query());
    let contents = query_value(&values, "raw") != Some("1");

    let mut short_key = String::new();
    let ok_mime = if !contents {
        "application/json".to_string()
    } else {
        let mut m = query_value(&values, "mimeType").unwrap_or("").to_string();
        if m.is_empty() {
            short_key = br.to_base64();
            m = state.mime_cache.get(&short_key);
        }
        m
    };

    let down = match state.registry.downloader(&state.args.server) {
        Ok(d) => d,
        Err(e) => {
            error!(server = %state.args.server, error = %e, "getting downloader");
            return error_response(&e);
        }
    };
    let body = match down.start(contents, std::slice::from_ref(&br)).await {
        Ok(body) => body,
        Err(e) => {
            warn!(blob = %br, error = %e, "download failed");
            return error_response(&e);
        }
    };

    let (mime_type, body) = if ok_mime.is_empty() || ok_mime == "application/octet-stream" {
        let mut w = SniffWriter::new(&ok_mime);
        w.write(&body);
        let (mime_type, body) = w.close();
        if !short_key.is_empty() && !mime_type.is_empty() {
            state.mime_cache.set(&short_key, &mime_type);
        }
        (mime_type, body)
    } else {
        (ok_mime, body)
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, body.len());
    if !mime_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, mime_type);
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build"))
}

/// POST /: multipart or direct upload, optional permanode attributes.
async fn handle_post(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let values = parse_query(req.uri().query());
    let uploader = match state.registry.uploader(&state.args.server) {
        Ok(u) => u,
        Err(e) => {
            error!(server = %state.args.server, error = %e, "getting uploader");
            return error_response(&e);
        }
    };
    let tmp = match mktemp_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "cannot create temporary directory");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "cannot create temporary directory",
            );
        }
    };
    let response = match ingest_and_upload(&state, &uploader, req, &values, &tmp).await {
        Ok(resp) => resp,
        Err(e) => error_response(&e),
    };
    let _ = tokio::fs::remove_dir_all(&tmp).await;
    response
}

async fn ingest_and_upload(
    state: &AppState,
    uploader: &Uploader,
    req: Request<Incoming>,
    values: &[(String, String)],
    tmp: &Path,
) -> Result<Response<Full<Bytes>>> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let last_modified = req
        .headers()
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_disposition = req
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    debug!(content_type = %media_type, "request Content-Type");

    let saved = match media_type.as_str() {
        "multipart/form" | "multipart/form-data" | "application/x-www-form-urlencoded" => {
            let qmtime = query_value(values, "mtime")
                .map(str::to_string)
                .unwrap_or_else(|| last_modified.clone());
            match save_multipart_to(tmp, &content_type, req, qmtime).await {
                Ok(saved) => saved,
                Err(e) => {
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        &format!("error parsing request body as multipart/form: {e}"),
                    ))
                }
            }
        }
        _ => {
            // legacy direct upload
            let mtime = parse_last_modified(&last_modified, query_value(values, "mtime").unwrap_or(""));
            save_direct_to(tmp, &content_type, &content_disposition, req, mtime).await?
        }
    };

    if saved.is_empty() {
        return Ok(text_response(StatusCode::BAD_REQUEST, "no files in request"));
    }
    info!(files = saved.len(), "uploading");

    let noperma = query_value(values, "noperma") == Some("1");
    let force_perma = !noperma && query_value(values, "permanode") == Some("1");
    let short = query_value(values, "short") == Some("1");

    let mut attrs: HashMap<String, String> = HashMap::new();
    if !noperma {
        for (k, v) in values {
            let Some(name) = k.strip_prefix("a.") else {
                continue;
            };
            if name.starts_with("camli") {
                continue;
            }
            attrs.entry(name.to_string()).or_insert_with(|| v.clone());
        }
    }

    let (target, target_mime): (PathBuf, String) = if saved.len() == 1 {
        saved[0].clone()
    } else {
        (tmp.to_path_buf(), String::new())
    };

    let (content, perma) = if force_perma {
        let (content, perma) = uploader.upload_file(&target, &target_mime, true).await?;
        if let Some(ref perma) = perma {
            let filtered = crate::upload::filter_attrs(crate::upload::RESERVED_ATTR_PREFIX, &attrs);
            if !filtered.is_empty() {
                if let Err(e) = uploader.set_permanode_attrs(perma, &filtered).await {
                    warn!(perma = %perma, error = %e, "setting permanode attributes");
                }
            }
        }
        (content, perma)
    } else {
        uploader
            .upload_file_lazy_attr(&target, &target_mime, &attrs)
            .await?
    };

    let short_key = content.to_base64();
    if saved.len() == 1 {
        if !target_mime.is_empty() {
            state.mime_cache.set(&short_key, &target_mime);
        }
        if let Some(root) = &state.args.paranoid {
            if let Some(dst) = paranoid_path(root, &content) {
                info!(src = %saved[0].0.display(), dst = %dst.display(), "paranoid copy");
                if let Err(e) = link_or_copy(&saved[0].0, &dst) {
                    warn!(dst = %dst.display(), error = %e, "paranoid copy failed");
                }
            }
        }
    }

    let mut body = String::with_capacity(128);
    if short {
        body.push_str(&short_key);
    } else {
        body.push_str(&content.to_string());
    }
    if let Some(perma) = perma {
        body.push('\n');
        if short {
            body.push_str(&perma.to_base64());
        } else {
            body.push_str(&perma.to_string());
        }
    }
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build")))
}

/// Save every file field of a multipart body under `dest`, returning
/// `(path, mime type)` pairs. A non-file `mtime` field overrides the
/// modification time for subsequent files.
async fn save_multipart_to(
    dest: &Path,
    content_type: &str,
    req: Request<Incoming>,
    mut qmtime: String,
) -> std::result::Result<Vec<(PathBuf, String)>, multer::Error> {
    let boundary = multer::parse_boundary(content_type)?;
    let mut multipart = multer::Multipart::new(BodyDataStream::new(req.into_body()), boundary);
    let mut saved = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            if field.name() == Some("mtime") {
                let text = field.text().await?;
                qmtime = text.chars().take(23).collect();
            }
            continue;
        };
        let mut mime_type = field
            .content_type()
            .map(|m| m.to_string())
            .unwrap_or_default();
        let data = field.bytes().await?;
        if mime_type.is_empty() || mime_type == "application/octet-stream" {
            mime_type = mime::match_mime(&mime_type, &data[..data.len().min(mime::SNIFF_LEN)]);
        }
        let path = dest.join(safe_base_name(&file_name));
        if let Err(e) = tokio::fs::write(&path, &data).await {
            warn!(path = %path.display(), error = %e, "saving multipart file");
            continue;
        }
        if let Some(mtime) = parse_last_modified("", &qmtime) {
            set_mtime(&path, mtime);
        }
        saved.push((path, mime_type));
    }
    Ok(saved)
}

/// Save a direct (non-multipart) body as one file under `dest`.
async fn save_direct_to(
    dest: &Path,
    content_type: &str,
    content_disposition: &str,
    req: Request<Incoming>,
    mtime: Option<SystemTime>,
) -> Result<Vec<(PathBuf, String)>> {
    let mut file_name = disposition_filename(content_disposition).unwrap_or_default();
    if file_name.is_empty() {
        debug!(
            content_disposition = content_disposition,
            "cannot determine filename"
        );
        let mut raw = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut raw);
        file_name = format!("file-{}", hex::encode(raw));
    }
    let data = req
        .collect()
        .await
        .map_err(|e| GateError::Io(std::io::Error::other(e)))?
        .to_bytes();
    let mut mime_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if mime_type.is_empty() || mime_type == "application/octet-stream" {
        mime_type = mime::match_mime(&mime_type, &data[..data.len().min(mime::SNIFF_LEN)]);
    }
    let path = dest.join(safe_base_name(&file_name));
    tokio::fs::write(&path, &data).await?;
    if let Some(mtime) = mtime {
        set_mtime(&path, mtime);
    }
    Ok(vec![(path, mime_type)])
}

/// Pull `filename=` out of a Content-Disposition header.
fn disposition_filename(cd: &str) -> Option<String> {
    for param in cd.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("filename") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Sanitize an uploaded filename: strip directories, unescape %-runs
/// while they keep shrinking the name, and cap overlong names at 255
/// bytes with a digest suffix to keep them unique.
fn safe_base_name(filename: &str) -> String {
    fn base(name: &str) -> &str {
        name.rsplit(['/', '\\']).next().unwrap_or(name)
    }
    let mut name = base(filename).to_string();
    let mut n = name.len();
    while name.contains('%') {
        match urlencoding::decode(&name) {
            Ok(decoded) => {
                let decoded = decoded.into_owned();
                if decoded.len() >= n {
                    break;
                }
                n = decoded.len();
                name = decoded;
            }
            Err(e) => {
                debug!(name = %name, error = %e, "unescape");
                break;
            }
        }
    }
    name = base(&name).to_string();
    if name.len() > 255 {
        let ext = name
            .rfind('.')
            .map(|i| name[i..].to_string())
            .unwrap_or_default();
        let digest =
            crate::blobref::BlobRef::from_data(crate::blobref::HashAlgo::Sha1, name.as_bytes())
                .to_base64();
        let digest = digest.split_once('-').map(|(_, d)| d.to_string()).unwrap_or(digest);
        let keep = 255usize.saturating_sub(1 + digest.len() + ext.len());
        let mut prefix = String::new();
        for c in name.chars() {
            if prefix.len() + c.len_utf8() > keep {
                break;
            }
            prefix.push(c);
        }
        let old = name;
        name = format!("{prefix}-{digest}{ext}");
        debug!(old = %old, new = %name, "filename too long");
    }
    name
}

/// Parse a Last-Modified-style header or an `mtime` value, which may
/// be an RFC timestamp or plain seconds since the epoch.
fn parse_last_modified(last_mod_header: &str, mtime_value: &str) -> Option<SystemTime> {
    if !last_mod_header.is_empty() {
        if let Some(t) = parse_time(last_mod_header) {
            return Some(t);
        }
    }
    if mtime_value.is_empty() {
        return None;
    }
    if mtime_value.len() >= 23 {
        let parsed = parse_time(mtime_value);
        if parsed.is_none() {
            warn!(mtime = mtime_value, "mtime too long, and not RFC1123-compliant");
        }
        return parsed;
    }
    match mtime_value.parse::<i64>() {
        Ok(secs) if secs >= 0 => Some(UNIX_EPOCH + Duration::from_secs(secs as u64)),
        _ => {
            warn!(mtime = mtime_value, "cannot parse mtime");
            None
        }
    }
}

fn parse_time(text: &str) -> Option<SystemTime> {
    if let Ok(t) = chrono::DateTime::parse_from_rfc2822(text) {
        return Some(t.into());
    }
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(t.into());
    }
    None
}

fn set_mtime(path: &Path, mtime: SystemTime) {
    let times = std::fs::FileTimes::new().set_modified(mtime);
    let res = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_times(times));
    if let Err(e) = res {
        warn!(path = %path.display(), error = %e, "chtimes");
    }
}

fn mktemp_dir() -> std::io::Result<PathBuf> {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    let dir = std::env::temp_dir().join(format!("camgate-{}", hex::encode(raw)));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Body writer that refuses to commit a Content-Type before it has
/// enough bytes to sniff. Headers are decided exactly once: when the
/// 1 KiB buffer fills, or at close when the stream ends short.
pub struct SniffWriter {
    mime_type: String,
    decided: bool,
    buf: Vec<u8>,
    out: Vec<u8>,
}

impl SniffWriter {
    pub fn new(mime_type: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            decided: false,
            buf: Vec::new(),
            out: Vec::new(),
        }
    }

    pub fn write(&mut self, p: &[u8]) {
        if !self.decided {
            if self.mime_type.is_empty() || self.mime_type == "application/octet-stream" {
                self.buf.extend_from_slice(p);
                if self.buf.len() < mime::SNIFF_LEN {
                    return;
                }
                self.mime_type = mime::match_mime(&self.mime_type, &self.buf);
                self.decided = true;
                let buf = std::mem::take(&mut self.buf);
                self.out.extend_from_slice(&buf);
                return;
            }
            self.decided = true;
        }
        self.out.extend_from_slice(p);
    }

    /// Flush residual buffered bytes and fix the final media type.
    pub fn close(mut self) -> (String, Vec<u8>) {
        if !self.decided && !self.buf.is_empty() {
            self.mime_type = mime::match_mime(&self.mime_type, &self.buf);
            let buf = std::mem::take(&mut self.buf);
            self.out.extend_from_slice(&buf);
        }
        (self.mime_type, self.out)
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response")
}

fn error_response(err: &GateError) -> Response<Full<Bytes>> {
    text_response(err.status_code(), &format!("{}: {err}", err.kind()))
}

fn unauthorized_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, format!("Basic realm=\"{REALM}\""))
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from("authorization required")))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_writer_commits_on_full_buffer() {
        let mut w = SniffWriter::new("");
        w.write(&b"%PDF-1.7 "[..]);
        w.write(&vec![b'x'; mime::SNIFF_LEN]);
        let (mime_type, body) = w.close();
        assert_eq!(mime_type, "application/pdf");
        assert_eq!(body.len(), 9 + mime::SNIFF_LEN);
    }

    #[test]
    fn sniff_writer_commits_at_close_for_short_bodies() {
        let mut w = SniffWriter::new("");
        w.write(b"tiny text body");
        let (mime_type, body) = w.close();
        assert_eq!(mime_type, "text/plain; charset=utf-8");
        assert_eq!(body, b"tiny text body");
    }

    #[test]
    fn sniff_writer_respects_supplied_type() {
        let mut w = SniffWriter::new("image/x-given");
        w.write(b"%PDF- would sniff as pdf");
        let (mime_type, _) = w.close();
        assert_eq!(mime_type, "image/x-given");
    }

    #[test]
    fn sniff_writer_overrides_octet_stream() {
        let mut w = SniffWriter::new("application/octet-stream");
        w.write(b"\x89PNG\r\n\x1a\npng bytes");
        let (mime_type, _) = w.close();
        assert_eq!(mime_type, "image/png");
    }

    #[test]
    fn safe_base_name_strips_and_unescapes() {
        assert_eq!(safe_base_name("/etc/passwd"), "passwd");
        assert_eq!(safe_base_name("dir\\sub\\file.txt"), "file.txt");
        assert_eq!(safe_base_name("sp%20ace.txt"), "sp ace.txt");
        let long = format!("{}.txt", "x".repeat(300));
        let capped = safe_base_name(&long);
        assert!(capped.len() <= 255);
        assert!(capped.ends_with(".txt"));
    }

    #[test]
    fn disposition_filename_parses() {
        assert_eq!(
            disposition_filename("attachment; filename=\"u.bin\""),
            Some("u.bin".to_string())
        );
        assert_eq!(
            disposition_filename("form-data; name=upfile; filename=x"),
            Some("x".to_string())
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn last_modified_parsing() {
        let t = parse_last_modified("", "1700000000").unwrap();
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap(),
            Duration::from_secs(1_700_000_000)
        );
        assert!(parse_last_modified("Tue, 15 Nov 1994 08:12:31 GMT", "").is_some());
        assert!(parse_last_modified("", "2023-11-14T22:13:20+00:00Z").is_none());
        assert!(parse_last_modified("", "2023-11-14T22:13:20+00:00").is_some());
        assert!(parse_last_modified("", "").is_none());
    }

    #[test]
    fn query_parsing_decodes() {
        let values = parse_query(Some("a.title=hello%20world&short=1"));
        assert_eq!(query_value(&values, "a.title"), Some("hello world"));
        assert_eq!(query_value(&values, "short"), Some("1"));
        assert_eq!(query_value(&values, "absent"), None);
    }
}
