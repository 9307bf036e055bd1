// Content sealing: static X25519 ECDH + XChaCha20-Poly1305
//
// Flow:
// 1. Convert our Ed25519 signing key → X25519 static secret
// 2. Convert the counterparty's Ed25519 public key → X25519 public key
// 3. ECDH: our_secret × their_public → shared_secret (same value on both ends)
// 4. KDF: Blake3::derive_key(shared_secret) → symmetric_key
// 5. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 6. Output: SealedContent { nonce, ciphertext }, bincode → hex on the wire
//
// The author key is already on the event, so the sealed blob carries no
// sender field. Either party can open it with their own secret and the other
// party's public key.

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// KDF context string for deriving content keys from ECDH shared secrets.
/// Changing this breaks compatibility with every sealed observation and payment.
const KDF_CONTEXT: &str = "datastream v1 content sealing 2026-10-01";

/// AAD binding sealed content to this protocol
const SEAL_AAD: &[u8] = b"datastream-content";

/// Upper bound on a sealed blob, hex-decoded
pub const MAX_SEALED_SIZE: usize = 256 * 1024;

/// Encrypted content as carried in an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedContent {
    /// XChaCha20-Poly1305 nonce (24 bytes)
    pub nonce: Vec<u8>,
    /// Encrypted + authenticated ciphertext
    pub ciphertext: Vec<u8>,
}

impl SealedContent {
    /// Encode for the event `content` field
    pub fn to_wire(&self) -> Result<String, CryptoError> {
        let bytes =
            bincode::serialize(self).map_err(|e| CryptoError::Encryption(e.to_string()))?;
        Ok(hex::encode(bytes))
    }

    /// Decode from the event `content` field
    pub fn from_wire(wire: &str) -> Result<Self, CryptoError> {
        if wire.len() > MAX_SEALED_SIZE * 2 {
            return Err(CryptoError::Decryption(format!(
                "sealed content too large: {} chars",
                wire.len()
            )));
        }
        let bytes = hex::decode(wire)
            .map_err(|e| CryptoError::Decryption(format!("content is not hex: {}", e)))?;
        bincode::deserialize(&bytes)
            .map_err(|e| CryptoError::Decryption(format!("bad sealed envelope: {}", e)))
    }
}

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// Ed25519 secret scalar is SHA-512(secret_key_bytes)[0..32]; x25519-dalek
/// clamps it on use.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Convert an Ed25519 verifying key to an X25519 public key
/// (Edwards → Montgomery, u = (1 + y) / (1 - y) mod p).
fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(public_key_bytes)
        .map_err(|_| CryptoError::InvalidKey("not an Ed25519 public key".to_string()))?;

    let edwards_point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 point does not decompress".to_string()))?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

fn content_key(
    own_signing_key: &SigningKey,
    counterparty_public_key: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let their_public = ed25519_public_to_x25519(counterparty_public_key)?;
    let our_secret = ed25519_to_x25519_secret(own_signing_key);
    let shared_secret = our_secret.diffie_hellman(&their_public);
    Ok(blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes()))
}

/// Seal plaintext for a counterparty.
pub fn seal_content(
    own_signing_key: &SigningKey,
    counterparty_public_key: &[u8; 32],
    plaintext: &[u8],
) -> Result<SealedContent, CryptoError> {
    let mut symmetric_key = content_key(own_signing_key, counterparty_public_key)?;

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    symmetric_key.zeroize();

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: SEAL_AAD,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(SealedContent {
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Open content sealed between us and a counterparty.
pub fn open_content(
    own_signing_key: &SigningKey,
    counterparty_public_key: &[u8; 32],
    sealed: &SealedContent,
) -> Result<Vec<u8>, CryptoError> {
    if sealed.nonce.len() != 24 {
        return Err(CryptoError::Decryption("invalid nonce length".to_string()));
    }

    let mut symmetric_key = content_key(own_signing_key, counterparty_public_key)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    symmetric_key.zeroize();

    cipher
        .decrypt(
            XNonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: SEAL_AAD,
            },
        )
        .map_err(|_| {
            CryptoError::Decryption("wrong key or corrupted ciphertext".to_string())
        })
}
