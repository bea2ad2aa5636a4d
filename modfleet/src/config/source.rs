//! Where per-community run specifications come from.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::trace;

use super::RunSpec;
use crate::{Error, Result};

/// A run specification together with a hash of the content it came from.
///
/// The heartbeat compares hashes to decide whether a community changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub hash: String,
    pub spec: RunSpec,
}

impl ConfigSnapshot {
    /// Build a snapshot from raw JSON content.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let spec: RunSpec = serde_json::from_slice(raw)
            .map_err(|e| Error::config(format!("could not parse run specification: {}", e)))?;
        Ok(Self {
            hash: content_hash(raw),
            spec,
        })
    }
}

/// Hex-encoded SHA-256 of `raw`.
pub fn content_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// Supplies run specifications per community.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the current specification for `community`.
    ///
    /// The returned spec has not been validated yet.
    async fn fetch(&self, community: &str) -> Result<ConfigSnapshot>;
}

/// Reads `<dir>/<community>.json` (community name lowercased).
pub struct DirectoryConfigSource {
    dir: PathBuf,
}

impl DirectoryConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, community: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", community.to_ascii_lowercase()))
    }
}

#[async_trait]
impl ConfigSource for DirectoryConfigSource {
    async fn fetch(&self, community: &str) -> Result<ConfigSnapshot> {
        let path = self.path_for(community);
        trace!(community, path = %path.display(), "Reading run specification");

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::config(format!(
                    "no run specification found at {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        ConfigSnapshot::from_json(&raw)
    }
}
