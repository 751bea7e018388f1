//! Runtime configuration
//!
//! Read from an optional `config.json` in the data directory. Every field
//! has a default, so a partial file (or none at all) is valid.
//!
//! ```json
//! {
//!   "key_namespace": "galacteek",
//!   "crypto": { "key_bits": 2048, "workers": 2 },
//!   "publish": { "retries": 3, "backoff_ms": 500 },
//!   "ps_keys_listen": ["g/peers/added", "g/peers/logout"],
//!   "media_images": { "ipfs-cube.png": "/usr/share/ipspace/ipfs-cube-64.png" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::DEFAULT_KEY_BITS;
use crate::error::SpaceResult;

/// File name looked up in the data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// First component of the root key name (`<namespace>.<profile>.root`)
    pub key_namespace: String,
    /// RSA settings
    pub crypto: CryptoConfig,
    /// Name publication settings
    pub publish: PublishConfig,
    /// Avatar CID applied to profiles that have none
    pub default_avatar: Option<String>,
    /// Local directory added to the network and linked as `css` in the DAG
    pub assets_dir: Option<PathBuf>,
    /// Local image files linked under `media/images/<name>` in every DAG
    pub media_images: BTreeMap<String, PathBuf>,
    /// Extra message bus keys bound by key listeners, as `a/b/c`
    pub ps_keys_listen: Vec<String>,
}

/// RSA settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Modulus size for generated keys
    pub key_bits: usize,
    /// Blocking workers available to RSA jobs
    pub workers: usize,
}

/// Name publication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Attempts after the first failed publication
    pub retries: u32,
    /// Delay before the first retry, doubled on each attempt
    pub backoff_ms: u64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            key_namespace: "galacteek".to_string(),
            crypto: CryptoConfig::default(),
            publish: PublishConfig::default(),
            default_avatar: None,
            assets_dir: None,
            media_images: BTreeMap::new(),
            ps_keys_listen: Vec::new(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
            workers: 2,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 500,
        }
    }
}

impl PublishConfig {
    /// Delay before the first retry.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl SpaceConfig {
    /// Load from `path`; a missing file gives the defaults.
    pub fn load(path: impl AsRef<Path>) -> SpaceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load `config.json` from a data directory.
    pub fn load_from_dir(data_dir: impl AsRef<Path>) -> SpaceResult<Self> {
        Self::load(data_dir.as_ref().join(CONFIG_FILE_NAME))
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> SpaceResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = SpaceConfig::load_from_dir(temp.path()).unwrap();
        assert_eq!(config, SpaceConfig::default());
        assert_eq!(config.key_namespace, "galacteek");
        assert_eq!(config.crypto.key_bits, 2048);
    }

    #[test]
    fn test_partial_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            r#"{ "publish": { "retries": 0 }, "ps_keys_listen": ["g/peers/added"] }"#,
        )
        .unwrap();

        let config = SpaceConfig::load_from_dir(temp.path()).unwrap();
        assert_eq!(config.publish.retries, 0);
        assert_eq!(config.publish.backoff_ms, 500);
        assert_eq!(config.ps_keys_listen, vec!["g/peers/added".to_string()]);
    }

    #[test]
    fn test_save_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);

        let mut config = SpaceConfig::default();
        config.default_avatar = Some("bafyavatar".to_string());
        config
            .media_images
            .insert("ipfs-cube.png".to_string(), PathBuf::from("/tmp/cube.png"));
        config.save(&path).unwrap();

        assert_eq!(SpaceConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ nope").unwrap();
        assert!(SpaceConfig::load(&path).is_err());
    }
}
