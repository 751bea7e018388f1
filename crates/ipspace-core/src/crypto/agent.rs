//! Per-profile crypto agent
//!
//! Holds the profile's public key in memory and reads the private key from
//! disk on first use. Everything encrypted "to self" can only be read back
//! by the same profile.

use std::path::{Path, PathBuf};

use cid::Cid;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::rsa::{self as rsa_env, RsaExecutor};
use crate::error::{SpaceError, SpaceResult};
use crate::node::NodeHandle;

/// Encrypts and decrypts payloads with one RSA identity.
pub struct CryptoAgent {
    node: NodeHandle,
    executor: RsaExecutor,
    public: RsaPublicKey,
    public_pem: String,
    private_key_path: PathBuf,
    private: OnceCell<RsaPrivateKey>,
}

impl CryptoAgent {
    /// Build an agent from the public key PEM and the path of the private
    /// key file.
    pub fn new(
        node: NodeHandle,
        executor: RsaExecutor,
        public_pem: &str,
        private_key_path: impl Into<PathBuf>,
    ) -> SpaceResult<Self> {
        let public = rsa_env::parse_public_pem(public_pem)?;
        Ok(Self {
            node,
            executor,
            public,
            public_pem: public_pem.to_string(),
            private_key_path: private_key_path.into(),
            private: OnceCell::new(),
        })
    }

    /// Public key in PEM form.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Path of the private key file.
    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    async fn private_key(&self) -> SpaceResult<&RsaPrivateKey> {
        self.private
            .get_or_try_init(|| async {
                debug!(path = ?self.private_key_path, "Reading private key");
                let pem = tokio::fs::read_to_string(&self.private_key_path).await?;
                self.executor
                    .run(move || rsa_env::parse_private_pem(&pem))
                    .await
            })
            .await
    }

    /// Encrypt for this agent.
    pub async fn encrypt(&self, plaintext: &[u8]) -> SpaceResult<Vec<u8>> {
        let public = self.public.clone();
        let data = plaintext.to_vec();
        self.executor
            .run(move || rsa_env::seal(&public, &data))
            .await
    }

    /// Encrypt for another identity given its public key PEM.
    pub async fn encrypt_for(&self, public_pem: &str, plaintext: &[u8]) -> SpaceResult<Vec<u8>> {
        let public = rsa_env::parse_public_pem(public_pem)?;
        let data = plaintext.to_vec();
        self.executor
            .run(move || rsa_env::seal(&public, &data))
            .await
    }

    /// Decrypt an envelope addressed to this agent.
    pub async fn decrypt(&self, sealed: &[u8]) -> SpaceResult<Vec<u8>> {
        let private = self.private_key().await?.clone();
        let data = sealed.to_vec();
        self.executor
            .run(move || rsa_env::open(&private, &data))
            .await
    }

    /// Encrypt a JSON document.
    pub async fn encrypt_json(&self, value: &Value) -> SpaceResult<Vec<u8>> {
        let bytes = serde_json::to_vec(value)?;
        self.encrypt(&bytes).await
    }

    /// Decrypt a JSON document.
    pub async fn decrypt_json(&self, sealed: &[u8]) -> SpaceResult<Value> {
        let bytes = self.decrypt(sealed).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SpaceError::DecryptionFailed(format!("Not a JSON document: {}", e)))
    }

    /// Encrypt `data` for self and store it on the network.
    pub async fn store_self(&self, data: &[u8]) -> SpaceResult<Cid> {
        let sealed = self.encrypt(data).await?;
        let cid = self.node.add_bytes(&sealed).await?;
        debug!(%cid, "Stored encrypted object");
        Ok(cid)
    }

    /// Fetch an object and decrypt it.
    pub async fn decrypt_object(&self, cid: &Cid) -> SpaceResult<Vec<u8>> {
        let sealed = self.node.cat(cid).await?;
        self.decrypt(&sealed).await
    }
}

impl std::fmt::Debug for CryptoAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoAgent")
            .field("private_key_path", &self.private_key_path)
            .finish_non_exhaustive()
    }
}
