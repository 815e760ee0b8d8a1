//! Key management behind a single trait boundary
//!
//! The enclave never touches key bytes directly: it asks a [`KmsService`] to
//! sign, decrypt, generate keys, draw randomness or attest. Two backends are
//! provided and chosen once at startup:
//!
//! - [`MockKmsService`]: emulates the Nitro Secure Module for simulation runs,
//!   including a self-signed certificate chain and Nitro-shaped attestation
//!   documents.
//! - [`NitroKmsService`]: talks to `/dev/nsm` inside a real enclave.

pub mod eth;
mod keys;
mod mock;
mod nitro;

pub use eth::EthSignature;
pub use keys::{seal_to, AppKey};
pub use mock::MockKmsService;
pub use nitro::NitroKmsService;

use crate::attestation::AttestationRequest;
use crate::config::{EnvSetup, KmsConfig};
use crate::error::{AttestationError, CryptoError, DecryptError, EnclaveError};
use k256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// What the backend can do, reported by `/public-key`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub nsm_available: bool,
    pub hardware_rng: bool,
    pub deterministic_signing: bool,
}

/// Public description of the enclave's signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoInfo {
    pub public_key_pem: String,
    pub eth_address: String,
    pub capabilities: CapabilityFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Secp256k1,
    Aes128,
    Aes256,
}

impl KeySpec {
    /// Key length in bytes for symmetric specs
    pub fn symmetric_len(&self) -> Option<usize> {
        match self {
            KeySpec::Secp256k1 => None,
            KeySpec::Aes128 => Some(16),
            KeySpec::Aes256 => Some(32),
        }
    }
}

impl FromStr for KeySpec {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SECP256K1" | "ECC_SECG_P256K1" => Ok(KeySpec::Secp256k1),
            "AES_128" => Ok(KeySpec::Aes128),
            "AES_256" | "SYMMETRIC_DEFAULT" => Ok(KeySpec::Aes256),
            other => Err(CryptoError::KeyGeneration(format!(
                "unsupported key spec {}",
                other
            ))),
        }
    }
}

/// Freshly generated key material.
///
/// For secp256k1 both halves are PEM. For AES the private half is the raw key
/// and the public half is the same key ECIES-sealed to the enclave key.
pub struct GeneratedKey {
    pub spec: KeySpec,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl std::fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("spec", &self.spec)
            .field("private_key", &"<redacted>")
            .field("public_key_len", &self.public_key.len())
            .finish()
    }
}

pub trait KmsService: Send + Sync {
    /// Describes the signing key; calling it repeatedly returns the same answer
    fn init_crypto(&self) -> Result<CryptoInfo, CryptoError>;

    /// Ethereum-style signature over `keccak256(data)`
    fn sign_data(&self, data: &[u8]) -> Result<EthSignature, CryptoError>;

    /// ECIES-decrypts a ciphertext addressed to the enclave key
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError>;

    fn generate_key(&self, spec: KeySpec) -> Result<GeneratedKey, CryptoError>;

    fn generate_random(&self, length: usize) -> Result<Vec<u8>, CryptoError>;

    /// COSE_Sign1 attestation document binding the enclave's public key
    fn generate_attestation(&self, request: &AttestationRequest) -> Result<Vec<u8>, AttestationError>;

    fn signing_public_key(&self) -> VerifyingKey;

    fn env_setup(&self) -> EnvSetup;
}

/// Builds the backend selected by `config.env_setup`
pub fn create_kms_service(config: &KmsConfig) -> Result<Arc<dyn KmsService>, EnclaveError> {
    let service: Arc<dyn KmsService> = match config.env_setup {
        EnvSetup::Sim => Arc::new(MockKmsService::from_config(config)?),
        EnvSetup::Nitro => Arc::new(NitroKmsService::open()?),
    };

    info!(
        env_setup = %service.env_setup(),
        eth_address = %eth::address(&service.signing_public_key()),
        "KMS service ready"
    );
    Ok(service)
}

/// Shared `init_crypto` body for backends holding an [`AppKey`]
fn crypto_info(key: &AppKey, capabilities: CapabilityFlags) -> Result<CryptoInfo, CryptoError> {
    Ok(CryptoInfo {
        public_key_pem: key.public_key_pem()?,
        eth_address: key.address(),
        capabilities,
    })
}

/// Shared `generate_key` body; `random` supplies the key bytes
fn generate_with(
    key: &AppKey,
    spec: KeySpec,
    random: impl Fn(usize) -> Result<Vec<u8>, CryptoError>,
) -> Result<GeneratedKey, CryptoError> {
    match spec.symmetric_len() {
        Some(len) => {
            let secret = random(len)?;
            let sealed = key.seal(&secret)?;
            Ok(GeneratedKey {
                spec,
                private_key: secret,
                public_key: sealed,
            })
        }
        None => {
            // rejection sampling: a 32-byte draw is outside the curve order with negligible odds
            for _ in 0..8 {
                let bytes = random(32)?;
                if let Ok(secret) = k256::SecretKey::from_slice(&bytes) {
                    let (private_pem, public_pem) = keys::secp256k1_pem_pair(&secret)?;
                    return Ok(GeneratedKey {
                        spec,
                        private_key: private_pem.into_bytes(),
                        public_key: public_pem.into_bytes(),
                    });
                }
            }
            Err(CryptoError::KeyGeneration(
                "could not draw a valid secp256k1 scalar".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_spec_parse() {
        assert_eq!("secp256k1".parse::<KeySpec>().unwrap(), KeySpec::Secp256k1);
        assert_eq!("AES_128".parse::<KeySpec>().unwrap(), KeySpec::Aes128);
        assert_eq!("SYMMETRIC_DEFAULT".parse::<KeySpec>().unwrap(), KeySpec::Aes256);
        assert!("RSA_2048".parse::<KeySpec>().is_err());
    }

    #[test]
    fn test_generated_key_debug_redacts() {
        let key = GeneratedKey {
            spec: KeySpec::Aes128,
            private_key: vec![0x42; 16],
            public_key: vec![1, 2, 3],
        };
        let debug = format!("{:?}", key);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("66"));
    }

    #[test]
    fn test_factory_selects_mock_in_simulation() {
        let service = create_kms_service(&KmsConfig::default()).unwrap();
        assert_eq!(service.env_setup(), EnvSetup::Sim);
        let info = service.init_crypto().unwrap();
        assert!(!info.capabilities.nsm_available);
    }
}
