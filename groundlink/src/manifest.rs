//! Versioned content manifests.
//!
//! A manifest is the small JSON descriptor the control plane serves for
//! every artifact: `{ "version": ..., "hash": "algo:hex", "url": ... }`.
//! The update domain historically served `{"sha256": "<hex>"}` instead of
//! the unified `hash` field; both shapes are accepted on input and
//! normalized to the unified form.

use crate::hash::{HashError, HashVerifier};
use crate::http::{HttpClient, HttpClientError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from verifying content against a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest carries no content hash; content is never accepted
    /// without one.
    #[error("manifest for version {0} does not declare a content hash")]
    MissingHash(String),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Errors from fetching a manifest from the control plane.
#[derive(Debug, Error)]
pub enum ManifestRequestError {
    #[error("failed to fetch manifest: {0}")]
    Http(#[from] HttpClientError),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("failed to decode manifest: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Immutable descriptor of a content artifact.
///
/// `version` is opaque and only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ManifestWire")]
pub struct Manifest {
    pub version: String,
    /// Content digest in `algo:hex` form.
    pub hash: String,
    /// Absolute location of the artifact.
    pub url: String,
}

/// Wire shape, accepting the legacy `sha256` field.
#[derive(Deserialize)]
struct ManifestWire {
    #[serde(default)]
    version: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    sha256: String,
    #[serde(default)]
    url: String,
}

impl From<ManifestWire> for Manifest {
    fn from(wire: ManifestWire) -> Self {
        let hash = if !wire.hash.is_empty() {
            wire.hash
        } else if !wire.sha256.is_empty() {
            format!("sha256:{}", wire.sha256)
        } else {
            String::new()
        };

        Self {
            version: wire.version,
            hash,
            url: wire.url,
        }
    }
}

impl Manifest {
    /// Builds the verifier for this manifest's declared hash.
    pub fn verifier(&self) -> Result<HashVerifier, ManifestError> {
        if self.hash.is_empty() {
            return Err(ManifestError::MissingHash(self.version.clone()));
        }
        Ok(HashVerifier::from_descriptor(&self.hash)?)
    }

    /// Verifies content bytes against the declared hash.
    pub fn verify(&self, content: &[u8]) -> Result<(), ManifestError> {
        self.verifier()?.verify_bytes(content)?;
        Ok(())
    }
}

/// Fetches manifests for the polling services.
///
/// Abstracted so tests and embedders can substitute their own source.
#[async_trait]
pub trait ManifestRequester: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Manifest, ManifestRequestError>;
}

/// Control-plane backed [`ManifestRequester`].
#[derive(Debug, Clone)]
pub struct HttpManifestRequester {
    client: HttpClient,
}

impl HttpManifestRequester {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestRequester for HttpManifestRequester {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Manifest, ManifestRequestError> {
        let response = self.client.get(url, cancel).await?;

        if response.status() != StatusCode::OK {
            return Err(ManifestRequestError::UnexpectedStatus(response.status()));
        }

        response
            .json::<Manifest>()
            .await
            .map_err(ManifestRequestError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{digest_hex, HashAlgorithm};

    fn manifest_for(content: &[u8]) -> Manifest {
        Manifest {
            version: "1.2.3".to_string(),
            hash: format!("sha256:{}", digest_hex(HashAlgorithm::Sha256, content)),
            url: "https://example.com/artifact".to_string(),
        }
    }

    #[test]
    fn decodes_unified_hash_form() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"version":"2.0.0","hash":"sha256:abc","url":"https://x/y"}"#,
        )
        .unwrap();

        assert_eq!(manifest.version, "2.0.0");
        assert_eq!(manifest.hash, "sha256:abc");
        assert_eq!(manifest.url, "https://x/y");
    }

    #[test]
    fn decodes_legacy_sha256_alias() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"version":"2.0.0","sha256":"abc","url":"https://x/y"}"#)
                .unwrap();

        assert_eq!(manifest.hash, "sha256:abc");
    }

    #[test]
    fn unified_hash_wins_over_alias() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"version":"2.0.0","hash":"md5:def","sha256":"abc","url":"https://x/y"}"#,
        )
        .unwrap();

        assert_eq!(manifest.hash, "md5:def");
    }

    #[test]
    fn serializes_unified_form_only() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"version":"2.0.0","sha256":"abc","url":"https://x/y"}"#)
                .unwrap();
        let json = serde_json::to_string(&manifest).unwrap();

        assert!(json.contains(r#""hash":"sha256:abc""#));
        assert!(!json.contains(r#""sha256":"abc""#));
    }

    #[test]
    fn verify_accepts_matching_content() {
        manifest_for(b"payload").verify(b"payload").unwrap();
    }

    #[test]
    fn verify_rejects_mismatching_content() {
        let err = manifest_for(b"payload").verify(b"tampered").unwrap_err();
        assert!(matches!(err, ManifestError::Hash(HashError::Mismatch { .. })));
    }

    #[test]
    fn empty_hash_is_refused_even_for_empty_content() {
        let manifest = Manifest {
            version: "1.0.0".to_string(),
            hash: String::new(),
            url: String::new(),
        };

        let err = manifest.verify(b"").unwrap_err();
        assert!(matches!(err, ManifestError::MissingHash(_)));
    }

    #[test]
    fn unknown_algorithm_is_not_a_mismatch() {
        let manifest = Manifest {
            version: "1.0.0".to_string(),
            hash: "crc32:deadbeef".to_string(),
            url: String::new(),
        };

        let err = manifest.verify(b"payload").unwrap_err();
        assert!(matches!(
            err,
            ManifestError::Hash(HashError::UnsupportedAlgorithm(_))
        ));
    }
}
