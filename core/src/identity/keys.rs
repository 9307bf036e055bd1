// Local key material — Ed25519 signing plus sealed-content encryption

use super::PublicKey;
use crate::crypto::{
    open_content, seal_content, ContentCipher, CryptoError, EventSigner, SealedContent,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

/// A provider's or subscriber's own keypair.
#[derive(Clone)]
pub struct LocalKeys {
    signing_key: SigningKey,
}

impl LocalKeys {
    /// Generate fresh random keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Secret key bytes, wiped on drop
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    /// Restore from secret key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Restore from a hex-encoded secret key
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for LocalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeys")
            .field("public_key", &self.public_key().as_hex())
            .finish()
    }
}

impl EventSigner for LocalKeys {
    fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(&self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        let signature = self.signing_key.sign(message);
        Ok(hex::encode(signature.to_bytes()))
    }

    fn verify(&self, author: &PublicKey, message: &[u8], signature: &str) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&author.to_bytes()) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(signature) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl ContentCipher for LocalKeys {
    fn encrypt(&self, plaintext: &str, counterparty: &PublicKey) -> Result<String, CryptoError> {
        seal_content(
            &self.signing_key,
            &counterparty.to_bytes(),
            plaintext.as_bytes(),
        )?
        .to_wire()
    }

    fn decrypt(&self, ciphertext: &str, counterparty: &PublicKey) -> Result<String, CryptoError> {
        let sealed = SealedContent::from_wire(ciphertext)?;
        let plaintext = open_content(&self.signing_key, &counterparty.to_bytes(), &sealed)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".to_string()))
    }
}
