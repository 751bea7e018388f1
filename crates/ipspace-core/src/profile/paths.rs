//! Profile filesystem layout

use std::path::{Path, PathBuf};

use crate::node::join_path;

/// Mutable-namespace root of a profile.
pub fn profile_root(name: &str) -> String {
    format!("/profiles/{}", name)
}

/// Paths of a profile inside the node's mutable namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePaths {
    root: String,
}

impl ProfilePaths {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn files(&self) -> String {
        join_path(&self.root, "files")
    }

    pub fn home(&self) -> String {
        join_path(&self.files(), "home")
    }

    pub fn multimedia(&self) -> String {
        join_path(&self.files(), "multimedia")
    }

    pub fn pictures(&self) -> String {
        join_path(&self.multimedia(), "pictures")
    }

    pub fn videos(&self) -> String {
        join_path(&self.multimedia(), "videos")
    }

    pub fn music(&self) -> String {
        join_path(&self.multimedia(), "music")
    }

    pub fn documents(&self) -> String {
        join_path(&self.files(), "documents")
    }

    pub fn code(&self) -> String {
        join_path(&self.files(), "code")
    }

    pub fn data(&self) -> String {
        join_path(&self.root, "data")
    }

    pub fn playlists(&self) -> String {
        join_path(&self.data(), "playlists")
    }

    /// Encrypted user information document.
    pub fn userinfo(&self) -> String {
        join_path(&self.data(), "userinfo.json.enc")
    }

    /// DAG metadata file.
    pub fn dag_meta(&self) -> String {
        join_path(&self.data(), "dag.main")
    }

    /// The fixed directories created on init, parents first.
    pub fn tree(&self) -> Vec<String> {
        vec![
            self.files(),
            self.home(),
            self.multimedia(),
            self.data(),
            self.playlists(),
            self.pictures(),
            self.videos(),
            self.documents(),
            self.music(),
            self.code(),
        ]
    }
}

/// RSA key files of a profile on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    /// PKCS#8 private key PEM
    pub private: PathBuf,
    /// SPKI public key PEM
    pub public: PathBuf,
}

impl KeyPaths {
    /// `<crypto_dir>/rsa_<name>_priv.key` and `<crypto_dir>/rsa_<name>_pub.key`
    pub fn new(crypto_dir: impl AsRef<Path>, name: &str) -> Self {
        let dir = crypto_dir.as_ref();
        Self {
            private: dir.join(format!("rsa_{}_priv.key", name)),
            public: dir.join(format!("rsa_{}_pub.key", name)),
        }
    }
}
