//! Content-addressed blob references
//!
//! A `BlobRef` names an immutable blob by the hash of its bytes. The
//! canonical text form is `<hash>-<lowercase hex>` (what the upstream
//! blob server accepts); a URL-safe short form `<hash>-<base64url>`
//! exists for compact keys and URLs. Both forms identify the same blob.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256};

use crate::types::{GateError, Result};

/// Hash algorithm used for write paths when none is requested.
pub const DEFAULT_HASH: HashAlgo = HashAlgo::Sha224;

/// Digest algorithms the upstream store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Sha1,
    Sha224,
    Sha256,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha224" => Some(Self::Sha224),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// An immutable content address: algorithm plus raw digest bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    algo: HashAlgo,
    digest: Vec<u8>,
}

impl BlobRef {
    /// Hash `data` and return its ref under `algo`.
    pub fn from_data(algo: HashAlgo, data: &[u8]) -> Self {
        let mut h = RefHasher::new(algo);
        h.update(data);
        h.finalize()
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// A ref is valid when its digest has the exact length its
    /// algorithm produces.
    pub fn is_valid(&self) -> bool {
        self.digest.len() == self.algo.digest_len()
    }

    /// Parse the canonical `<hash>-<lowercase hex>` form.
    pub fn parse(text: &str) -> Result<Self> {
        let (name, hexpart) = text
            .split_once('-')
            .ok_or_else(|| GateError::MalformedRef(format!("no '-' in {text:?}")))?;
        if name.is_empty() {
            return Err(GateError::MalformedRef(format!("empty hash name in {text:?}")));
        }
        let algo = HashAlgo::from_name(name)
            .ok_or_else(|| GateError::MalformedRef(format!("unknown hash name {name:?}")))?;
        let digest = hex::decode(hexpart)
            .map_err(|e| GateError::MalformedRef(format!("bad hex in {text:?}: {e}")))?;
        if digest.len() != algo.digest_len() {
            return Err(GateError::MalformedRef(format!(
                "wrong digest length for {name}: got {}, want {}",
                digest.len(),
                algo.digest_len()
            )));
        }
        Ok(Self { algo, digest })
    }

    /// Parse the short `<hash>-<base64url>` form. The hash name is
    /// lower-cased, the remainder base64url-decoded, then the result is
    /// re-serialised as canonical hex and reparsed.
    pub fn parse_base64(text: &str) -> Result<Self> {
        let (name, b64) = text
            .split_once('-')
            .ok_or_else(|| GateError::MalformedRef(format!("no '-' in {text:?}")))?;
        if name.is_empty() {
            return Err(GateError::MalformedRef(format!("empty hash name in {text:?}")));
        }
        let digest = URL_SAFE
            .decode(b64)
            .map_err(|e| GateError::MalformedRef(format!("cannot decode {b64:?} as base64: {e}")))?;
        let canonical = format!("{}-{}", name.to_ascii_lowercase(), hex::encode(digest));
        Self::parse(&canonical)
    }

    /// Parse either form; tries canonical first, then base64.
    pub fn parse_any(text: &str) -> Result<Self> {
        Self::parse(text).or_else(|_| Self::parse_base64(text))
    }

    /// The short form: `<hash>-<base64url of digest>`.
    pub fn to_base64(&self) -> String {
        format!("{}-{}", self.algo.name(), URL_SAFE.encode(&self.digest))
    }

    /// Binary form `<hash name>-<raw digest bytes>`, used as KV keys.
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.algo.name().as_bytes();
        let mut out = Vec::with_capacity(name.len() + 1 + self.digest.len());
        out.extend_from_slice(name);
        out.push(b'-');
        out.extend_from_slice(&self.digest);
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let sep = raw
            .iter()
            .position(|&b| b == b'-')
            .ok_or_else(|| GateError::MalformedRef("no '-' in binary ref".into()))?;
        let name = std::str::from_utf8(&raw[..sep])
            .map_err(|_| GateError::MalformedRef("non-utf8 hash name in binary ref".into()))?;
        let algo = HashAlgo::from_name(name)
            .ok_or_else(|| GateError::MalformedRef(format!("unknown hash name {name:?}")))?;
        let digest = raw[sep + 1..].to_vec();
        if digest.len() != algo.digest_len() {
            return Err(GateError::MalformedRef(format!(
                "wrong digest length for {name}: got {}, want {}",
                digest.len(),
                algo.digest_len()
            )));
        }
        Ok(Self { algo, digest })
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algo.name(), hex::encode(&self.digest))
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({self})")
    }
}

impl FromStr for BlobRef {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for BlobRef {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

/// A ref together with the stored byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedRef {
    pub blob_ref: BlobRef,
    pub size: u32,
}

/// Incremental hasher that finalizes into a [`BlobRef`].
pub enum RefHasher {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
}

impl RefHasher {
    pub fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgo::Sha224 => Self::Sha224(Sha224::new()),
            HashAlgo::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> BlobRef {
        match self {
            Self::Sha1(h) => BlobRef {
                algo: HashAlgo::Sha1,
                digest: h.finalize().to_vec(),
            },
            Self::Sha224(h) => BlobRef {
                algo: HashAlgo::Sha224,
                digest: h.finalize().to_vec(),
            },
            Self::Sha256(h) => BlobRef {
                algo: HashAlgo::Sha256,
                digest: h.finalize().to_vec(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let br = BlobRef::from_data(HashAlgo::Sha1, b"hello");
        let parsed = BlobRef::parse(&br.to_string()).unwrap();
        assert_eq!(br, parsed);
        assert!(br.is_valid());
    }

    #[test]
    fn base64_roundtrip_sha1() {
        let short = "sha1-9sfOFOkcUBM2igo8PCS9aWd42CM=";
        let br = BlobRef::parse_base64(short).unwrap();
        assert_eq!(
            br.to_string(),
            "sha1-f6c7ce14e91c5013368a0a3c3c24bd696778d823"
        );
        assert_eq!(br.to_base64(), short);
    }

    #[test]
    fn base64_roundtrip_sha224() {
        // The base64 part itself contains a '-'; only the first one splits.
        let short = "sha224-0UoCjCo6K8lHYQK7KII0xBWisB-CjqYqxbPkLw==";
        let br = BlobRef::parse_base64(short).unwrap();
        assert_eq!(
            br.to_string(),
            "sha224-d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
        assert_eq!(br.to_base64(), short);
    }

    #[test]
    fn base64_uppercases_hash_name() {
        let br = BlobRef::parse_base64("SHA1-9sfOFOkcUBM2igo8PCS9aWd42CM=").unwrap();
        assert_eq!(br.algo(), HashAlgo::Sha1);
    }

    #[test]
    fn rejects_malformed() {
        assert!(BlobRef::parse("nodash").is_err());
        assert!(BlobRef::parse("-abcdef").is_err());
        assert!(BlobRef::parse("sha1-zzzz").is_err());
        assert!(BlobRef::parse("sha1-abcd").is_err()); // wrong length
        assert!(BlobRef::parse("md5-d41d8cd98f00b204e9800998ecf8427e").is_err());
        assert!(BlobRef::parse_base64("sha1-!!!!").is_err());
    }

    #[test]
    fn binary_roundtrip() {
        let br = BlobRef::from_data(HashAlgo::Sha224, b"some bytes");
        let raw = br.to_bytes();
        assert!(raw.starts_with(b"sha224-"));
        assert_eq!(BlobRef::from_bytes(&raw).unwrap(), br);
    }

    #[test]
    fn parse_any_accepts_both_forms() {
        let br = BlobRef::from_data(HashAlgo::Sha1, b"x");
        assert_eq!(BlobRef::parse_any(&br.to_string()).unwrap(), br);
        assert_eq!(BlobRef::parse_any(&br.to_base64()).unwrap(), br);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut h = RefHasher::new(HashAlgo::Sha256);
        h.update(b"split ");
        h.update(b"input");
        assert_eq!(h.finalize(), BlobRef::from_data(HashAlgo::Sha256, b"split input"));
    }
}
