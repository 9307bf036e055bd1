// Cryptography module — signing and content-encryption capabilities
//
// The protocol only needs four operations: sign, verify, encrypt, decrypt.
// They are traits so a host can plug in whatever scheme its relays expect;
// `LocalKeys` is the bundled implementation.

pub mod encrypt;

use crate::identity::PublicKey;
use thiserror::Error;

pub use encrypt::{open_content, seal_content, SealedContent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Produces and checks event signatures.
pub trait EventSigner: Send + Sync {
    /// Public key events are authored under
    fn public_key(&self) -> PublicKey;

    /// Sign a message, returning the hex signature
    fn sign(&self, message: &[u8]) -> Result<String, CryptoError>;

    /// Check a hex signature made by `author`
    fn verify(&self, author: &PublicKey, message: &[u8], signature: &str) -> bool;
}

/// Encrypts content between two keys.
///
/// Key agreement is static-static: `counterparty` is the recipient when
/// encrypting and the sender when decrypting, so both ends can open it.
pub trait ContentCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str, counterparty: &PublicKey) -> Result<String, CryptoError>;

    fn decrypt(&self, ciphertext: &str, counterparty: &PublicKey) -> Result<String, CryptoError>;
}

/// Everything a client needs from its key material.
pub trait Keyring: EventSigner + ContentCipher {}

impl<T: EventSigner + ContentCipher> Keyring for T {}
