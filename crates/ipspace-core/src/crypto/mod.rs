//! Crypto layer
//!
//! | Purpose | Algorithm |
//! |---------|-----------|
//! | Identity keypair | RSA (PKCS#8 / SPKI PEM on disk) |
//! | Key wrapping | RSA-OAEP with SHA-256 |
//! | Payload encryption | ChaCha20-Poly1305 |

mod agent;
mod cipher;
pub mod rsa;

pub use agent::CryptoAgent;
pub use cipher::{ContentKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use rsa::{RsaExecutor, RsaKeyPem, SealedEnvelope, DEFAULT_KEY_BITS, ENVELOPE_VERSION};
