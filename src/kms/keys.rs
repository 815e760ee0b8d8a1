//! The enclave's secp256k1 application key
//!
//! One key per process: it signs results, decrypts ECIES ciphertexts
//! addressed to the enclave and seals generated data keys.

use super::eth::{self, EthSignature};
use crate::error::{CryptoError, DecryptError};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use k256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

/// Uncompressed SEC1 point (0x04) + AES-GCM nonce + tag
const ECIES_MIN_LEN: usize = 65 + 16 + 16;

pub struct AppKey {
    signing: SigningKey,
}

impl std::fmt::Debug for AppKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl AppKey {
    pub fn random() -> Self {
        Self {
            signing: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Derives the key from a seed so repeated runs share one identity
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(b"enclave-bridge/app-key");
        hasher.update(seed);
        Self::from_secret_bytes(&hasher.finalize())
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing =
            SigningKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { signing })
    }

    /// Loads a PKCS#8 or SEC1 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .or_else(|_| SecretKey::from_sec1_pem(pem))
            .map_err(|e| CryptoError::InvalidKey(format!("secp256k1 PEM: {}", e)))?;
        Ok(Self {
            signing: SigningKey::from(secret),
        })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing.verifying_key()
    }

    /// 65-byte uncompressed public point
    pub fn public_point(&self) -> Vec<u8> {
        self.verifying_key().to_encoded_point(false).as_bytes().to_vec()
    }

    /// SubjectPublicKeyInfo DER, as bound into attestation documents
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        PublicKey::from(self.verifying_key())
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        PublicKey::from(self.verifying_key())
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn address(&self) -> String {
        eth::address(self.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Result<EthSignature, CryptoError> {
        eth::sign(&self.signing, data)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if ciphertext.len() < ECIES_MIN_LEN {
            return Err(DecryptError::Malformed(format!(
                "{} bytes is shorter than the {} byte envelope",
                ciphertext.len(),
                ECIES_MIN_LEN
            )));
        }
        if ciphertext[0] != 0x04 {
            return Err(DecryptError::Malformed(
                "ephemeral key is not an uncompressed point".to_string(),
            ));
        }
        ecies::decrypt(&self.signing.to_bytes(), ciphertext).map_err(|_| DecryptError::Mismatch)
    }

    /// Encrypts `plaintext` to this key
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_to(&self.public_point(), plaintext)
    }
}

/// ECIES-encrypts `plaintext` to a SEC1 secp256k1 public key
pub fn seal_to(public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    ecies::encrypt(public_key, plaintext)
        .map_err(|e| CryptoError::InvalidKey(format!("ECIES encrypt: {:?}", e)))
}

/// PKCS#8 PEM of a fresh secp256k1 key built from `secret` bytes
pub(crate) fn secp256k1_pem_pair(secret: &SecretKey) -> Result<(String, String), CryptoError> {
    let private = secret
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public = secret
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    Ok((private.to_string(), public))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_round_trip() {
        let key = AppKey::random();
        let sealed = key.seal(b"hello").unwrap();
        assert_eq!(key.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_decrypt_for_other_key_is_mismatch() {
        let key = AppKey::random();
        let other = AppKey::random();
        let sealed = other.seal(b"not yours").unwrap();
        assert_eq!(key.decrypt(&sealed), Err(DecryptError::Mismatch));
    }

    #[test]
    fn test_decrypt_short_input_is_malformed() {
        let key = AppKey::random();
        assert!(matches!(
            key.decrypt(&[0x04; 10]),
            Err(DecryptError::Malformed(_))
        ));
    }

    #[test]
    fn test_seeded_key_is_stable() {
        let a = AppKey::from_seed(b"seed").unwrap();
        let b = AppKey::from_seed(b"seed").unwrap();
        let c = AppKey::from_seed(b"other").unwrap();
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
    }

    #[test]
    fn test_pem_round_trip() {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let (private_pem, public_pem) = secp256k1_pem_pair(&secret).unwrap();
        let key = AppKey::from_pem(&private_pem).unwrap();
        assert_eq!(key.public_key_pem().unwrap(), public_pem);
        assert!(public_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
