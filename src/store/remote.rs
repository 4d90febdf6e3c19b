//! HTTP client store against the upstream blob server
//!
//! Speaks the upstream server's wire protocol: `GET /camli/<ref>` for
//! fetches, form-encoded `POST /camli/stat`, multipart
//! `POST /camli/upload`, and `GET /camli/enumerate-blobs`. Reads and
//! stats ride the retrying transport; uploads carry a streaming
//! multipart body and therefore get a single attempt (re-driving a
//! failed upload is the uploader's job, and is safe because blobs are
//! content addressed).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::blobref::{BlobRef, SizedRef};
use crate::store::{BlobStore, Generation, StatFn};
use crate::transport::{RetryClient, RetryStrategy};
use crate::types::{GateError, Result};

pub struct RemoteStore {
    base: String,
    client: RetryClient,
}

#[derive(Deserialize)]
struct WireSizedRef {
    #[serde(rename = "blobRef")]
    blob_ref: String,
    size: u32,
}

impl WireSizedRef {
    fn parse(&self) -> Result<SizedRef> {
        Ok(SizedRef {
            blob_ref: BlobRef::parse(&self.blob_ref)?,
            size: self.size,
        })
    }
}

#[derive(Deserialize)]
struct StatResponse {
    #[serde(default)]
    stat: Vec<WireSizedRef>,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    received: Vec<WireSizedRef>,
}

#[derive(Deserialize)]
struct EnumerateResponse {
    #[serde(default)]
    blobs: Vec<WireSizedRef>,
    #[serde(rename = "continueAfter")]
    continue_after: Option<String>,
}

impl RemoteStore {
    pub fn new(server: &str, insecure_tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| GateError::Downstream(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base: server.trim_end_matches('/').to_string(),
            client: RetryClient::new(client, RetryStrategy::default()),
        })
    }

    pub fn server(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn stat_map(&self, refs: &[BlobRef]) -> Result<HashMap<String, u32>> {
        let mut form = vec![("camliversion".to_string(), "1".to_string())];
        for (i, br) in refs.iter().enumerate() {
            form.push((format!("blob{}", i + 1), br.to_string()));
        }
        let req = self
            .client
            .client()
            .post(self.url("/camli/stat"))
            .form(&form)
            .build()
            .map_err(GateError::from)?;
        let resp = self.client.execute(req, None).await?;
        if !resp.status().is_success() {
            return Err(GateError::Downstream(format!(
                "stat: HTTP {} from {}",
                resp.status(),
                self.base
            )));
        }
        let parsed: StatResponse = resp.json().await?;
        let mut out = HashMap::with_capacity(parsed.stat.len());
        for wire in parsed.stat {
            let sr = wire.parse()?;
            out.insert(sr.blob_ref.to_string(), sr.size);
        }
        Ok(out)
    }
}

#[async_trait]
impl BlobStore for RemoteStore {
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        let req = self
            .client
            .client()
            .get(self.url(&format!("/camli/{br}")))
            .build()
            .map_err(GateError::from)?;
        let resp = self.client.execute(req, None).await?;
        match resp.status().as_u16() {
            404 => Err(GateError::NotFound(br.to_string())),
            s if !resp.status().is_success() => Err(GateError::Downstream(format!(
                "fetch {br}: HTTP {s} from {}",
                self.base
            ))),
            _ => {
                let body = resp.bytes().await?;
                Ok((body.to_vec(), body.len() as u32))
            }
        }
    }

    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        // skip the upload when the server already has the blob
        if let Some(size) = self.stat_map(std::slice::from_ref(br)).await?.get(&br.to_string()) {
            debug!(blob = %br, size, "server already has blob");
            return Ok(SizedRef {
                blob_ref: br.clone(),
                size: *size,
            });
        }
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(br.to_string());
        let form = reqwest::multipart::Form::new().part(br.to_string(), part);
        let resp = self
            .client
            .client()
            .post(self.url("/camli/upload"))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GateError::Downstream(format!(
                "upload {br}: HTTP {} from {}",
                resp.status(),
                self.base
            )));
        }
        let parsed: UploadResponse = resp.json().await?;
        for wire in parsed.received {
            let sr = wire.parse()?;
            if sr.blob_ref == *br {
                return Ok(sr);
            }
        }
        // some servers omit already-known blobs from `received`
        Ok(SizedRef {
            blob_ref: br.clone(),
            size: data.len() as u32,
        })
    }

    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        let present = self.stat_map(refs).await?;
        for br in refs {
            if let Some(size) = present.get(&br.to_string()) {
                f(SizedRef {
                    blob_ref: br.clone(),
                    size: *size,
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
        let mut after = after.map(|br| br.to_string());
        let mut sent = 0;
        loop {
            let mut url = self.url("/camli/enumerate-blobs?camliversion=1");
            if let Some(ref a) = after {
                url.push_str(&format!("&after={a}"));
            }
            if limit != 0 {
                url.push_str(&format!("&limit={}", limit - sent));
            }
            let req = self
                .client
                .client()
                .get(&url)
                .build()
                .map_err(GateError::from)?;
            let resp = self.client.execute(req, None).await?;
            if !resp.status().is_success() {
                return Err(GateError::Downstream(format!(
                    "enumerate: HTTP {} from {}",
                    resp.status(),
                    self.base
                )));
            }
            let parsed: EnumerateResponse = resp.json().await?;
            for wire in &parsed.blobs {
                if dest.send(wire.parse()?).await.is_err() {
                    return Ok(());
                }
                sent += 1;
                if limit != 0 && sent >= limit {
                    return Ok(());
                }
            }
            match parsed.continue_after {
                Some(next) if !parsed.blobs.is_empty() => after = Some(next),
                _ => return Ok(()),
            }
        }
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        let mut form = vec![("camliversion".to_string(), "1".to_string())];
        for (i, br) in refs.iter().enumerate() {
            form.push((format!("blob{}", i + 1), br.to_string()));
        }
        let req = self
            .client
            .client()
            .post(self.url("/camli/remove"))
            .form(&form)
            .build()
            .map_err(GateError::from)?;
        let resp = self.client.execute(req, None).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            404 | 405 => Err(GateError::Unsupported(format!(
                "server {} does not allow blob removal",
                self.base
            ))),
            s => Err(GateError::Downstream(format!(
                "remove: HTTP {s} from {}",
                self.base
            ))),
        }
    }

    async fn generation(&self) -> Result<Generation> {
        Err(GateError::Unsupported(
            "remote store does not expose its generation".into(),
        ))
    }

    async fn reset_generation(&self) -> Result<Generation> {
        Err(GateError::Unsupported(
            "remote store does not expose its generation".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let store = RemoteStore::new("http://localhost:3179/", false).unwrap();
        assert_eq!(store.server(), "http://localhost:3179");
        assert_eq!(store.url("/camli/stat"), "http://localhost:3179/camli/stat");
    }

    #[test]
    fn wire_ref_parses() {
        let wire = WireSizedRef {
            blob_ref: "sha1-f6c7ce14e91c5013368a0a3c3c24bd696778d823".into(),
            size: 42,
        };
        let sr = wire.parse().unwrap();
        assert_eq!(sr.size, 42);
        assert_eq!(
            sr.blob_ref.to_string(),
            "sha1-f6c7ce14e91c5013368a0a3c3c24bd696778d823"
        );
    }
}
