use regex::Regex;
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

// OCI digest grammar: `algorithm ":" encoded`.
static DIGEST_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").unwrap()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("malformed digest `{0}`")]
    Malformed(String),

    #[error("unsupported digest algorithm `{0}`")]
    UnsupportedAlgorithm(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in an encoded digest of this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Content address of a blob or manifest, `algorithm:hex`.
///
/// The hex part is normalised to lower case on construction, so derived
/// equality compares digests case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn new(algorithm: Algorithm, hex: &str) -> Result<Self, DigestError> {
        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::Malformed(format!("{algorithm}:{hex}")));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn compute(algorithm: Algorithm, bytes: &[u8]) -> Self {
        let mut hasher = DigestHasher::new();
        hasher.update(bytes);
        hasher.finalize(algorithm)
    }

    pub fn sha256(bytes: &[u8]) -> Self {
        Self::compute(Algorithm::Sha256, bytes)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether `reference` is shaped like a digest rather than a tag. This is
    /// a syntax check only: the algorithm may still be unsupported.
    pub fn is_digest_syntax(reference: &str) -> bool {
        DIGEST_SYNTAX.is_match(reference)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(s.to_string()))?;
        Digest::new(algorithm.parse()?, hex)
    }
}

/// Incremental hash state for an upload in progress.
///
/// The claimed algorithm is only known at commit time, so both supported
/// algorithms are fed every chunk.
#[derive(Clone)]
pub struct DigestHasher {
    sha256: Sha256,
    sha512: Sha512,
    len: u64,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            sha512: Sha512::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.sha256.update(bytes);
        self.sha512.update(bytes);
        self.len += bytes.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.len
    }

    pub fn finalize(self, algorithm: Algorithm) -> Digest {
        let hex = match algorithm {
            Algorithm::Sha256 => hex::encode(self.sha256.finalize()),
            Algorithm::Sha512 => hex::encode(self.sha512.finalize()),
        };
        Digest { algorithm, hex }
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestHasher").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_compute_empty() {
        assert_eq!(Digest::sha256(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_parse_and_display() {
        let digest: Digest = EMPTY_SHA256.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_hex_is_case_insensitive() {
        let upper: Digest = EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256").parse().unwrap();
        let lower: Digest = EMPTY_SHA256.parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_rejects_bad_digests() {
        assert!(matches!("sha256:abc".parse::<Digest>(), Err(DigestError::Malformed(_))));
        assert!(matches!("latest".parse::<Digest>(), Err(DigestError::Malformed(_))));
        assert!(matches!(
            "md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Digest>(),
            Err(DigestError::UnsupportedAlgorithm(_))
        ));
        let not_hex = format!("sha256:{}", "z".repeat(64));
        assert!(not_hex.parse::<Digest>().is_err());
    }

    #[test]
    fn test_digest_syntax() {
        assert!(Digest::is_digest_syntax(EMPTY_SHA256));
        assert!(Digest::is_digest_syntax("md5:abc"));
        assert!(!Digest::is_digest_syntax("latest"));
        assert!(!Digest::is_digest_syntax("v1.2.3"));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let payload = b"hello incremental world";
        let mut hasher = DigestHasher::new();
        hasher.update(&payload[..5]);
        hasher.update(&payload[5..]);
        assert_eq!(hasher.bytes_hashed(), payload.len() as u64);
        assert_eq!(
            hasher.clone().finalize(Algorithm::Sha256),
            Digest::compute(Algorithm::Sha256, payload)
        );
        assert_eq!(
            hasher.finalize(Algorithm::Sha512),
            Digest::compute(Algorithm::Sha512, payload)
        );
    }
}
