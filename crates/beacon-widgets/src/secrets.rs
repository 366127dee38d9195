use beacon_core::{BeaconError, Result, SecretCodec};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 24;

/// XChaCha20-Poly1305 codec for PASSWORD-typed parameter values.
///
/// The key is the SHA-256 digest of the configured passphrase. Ciphertext is
/// `hex(nonce || sealed)` with a fresh random nonce per value, so encrypting
/// the same secret twice yields different text.
pub struct ChaChaCodec {
    cipher: XChaCha20Poly1305,
}

impl ChaChaCodec {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: XChaCha20Poly1305::new(&key),
        }
    }
}

impl SecretCodec for ChaChaCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| BeaconError::Codec(format!("nonce generation failed: {e}")))?;
        let sealed = self
            .cipher
            .encrypt(&XNonce::from(nonce), plaintext.as_bytes())
            .map_err(|e| BeaconError::Codec(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let raw = hex::decode(ciphertext.trim())
            .map_err(|e| BeaconError::Codec(format!("ciphertext is not hex: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(BeaconError::Codec("ciphertext too short".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| BeaconError::Codec("nonce length mismatch".into()))?;
        let plain = self
            .cipher
            .decrypt(&XNonce::from(nonce), sealed)
            .map_err(|_| BeaconError::Codec("authentication failed".into()))?;
        String::from_utf8(plain).map_err(|e| BeaconError::Codec(e.to_string()))
    }
}
