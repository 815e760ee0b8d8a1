//! Emulated Nitro Secure Module for simulation runs

use super::{
    crypto_info, generate_with, AppKey, CapabilityFlags, CryptoInfo, EthSignature, GeneratedKey,
    KeySpec, KmsService,
};
use crate::attestation::{
    AttestationBuilder, AttestationRequest, CertificateChain, Es384Signer, Measurements, PCR_LENGTH,
};
use crate::config::{EnvSetup, KmsConfig};
use crate::error::{AttestationError, CryptoError, DecryptError};
use chrono::Utc;
use k256::ecdsa::VerifyingKey;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384};
use std::path::Path;
use tracing::{debug, info};

/// secp256k1 application key, PKCS#8 or SEC1 PEM
pub const APP_KEY_FILE: &str = "enclave_app_key.pem";
/// P-384 attestation key, PKCS#8 PEM
pub const ATTESTATION_KEY_FILE: &str = "enclave_key.pem";

const CERT_VALIDITY_DAYS: i64 = 30;
const MEASURED_PCRS: [(u16, &str); 3] = [
    (0, "enclave-bridge/pcr0/image"),
    (1, "enclave-bridge/pcr1/kernel"),
    (2, "enclave-bridge/pcr2/application"),
];

/// KMS backend used when no NSM is present.
///
/// Keys are fixed for the lifetime of the service: either loaded from a key
/// directory, derived from a seed, or drawn once at construction.
#[derive(Debug)]
pub struct MockKmsService {
    app_key: AppKey,
    attestation_key: Es384Signer,
    builder: AttestationBuilder,
    seeded: bool,
}

impl MockKmsService {
    /// Fresh random keys
    pub fn generate() -> Result<Self, CryptoError> {
        Self::assemble(AppKey::random(), Es384Signer::generate()?, None)
    }

    /// Seed-derived application key and measurements
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, CryptoError> {
        Self::assemble(AppKey::from_seed(seed)?, Es384Signer::generate()?, Some(seed))
    }

    /// Loads whichever key files exist in `dir`; missing ones are generated
    pub fn from_key_dir(dir: &Path, seed: Option<&[u8; 32]>) -> Result<Self, CryptoError> {
        let app_path = dir.join(APP_KEY_FILE);
        let app_key = if app_path.exists() {
            debug!(path = %app_path.display(), "Loading application key");
            AppKey::from_pem(&std::fs::read_to_string(&app_path)?)?
        } else {
            match seed {
                Some(seed) => AppKey::from_seed(seed)?,
                None => AppKey::random(),
            }
        };

        let attestation_path = dir.join(ATTESTATION_KEY_FILE);
        let attestation_key = if attestation_path.exists() {
            debug!(path = %attestation_path.display(), "Loading attestation key");
            let pem = std::fs::read_to_string(&attestation_path)?;
            let key = rcgen::KeyPair::from_pem(&pem)
                .map_err(|e| CryptoError::InvalidKey(format!("{}: {}", ATTESTATION_KEY_FILE, e)))?;
            Es384Signer::from_pkcs8(&key.serialize_der())?
        } else {
            Es384Signer::generate()?
        };

        Self::assemble(app_key, attestation_key, seed)
    }

    pub fn from_config(config: &KmsConfig) -> Result<Self, CryptoError> {
        match (&config.mock_keys_dir, &config.mock_seed) {
            (Some(dir), seed) => Self::from_key_dir(dir, seed.as_ref()),
            (None, Some(seed)) => Self::from_seed(seed),
            (None, None) => Self::generate(),
        }
    }

    fn assemble(
        app_key: AppKey,
        attestation_key: Es384Signer,
        seed: Option<&[u8; 32]>,
    ) -> Result<Self, CryptoError> {
        let chain = CertificateChain::issue(
            &attestation_key,
            "enclave-bridge mock enclave",
            CERT_VALIDITY_DAYS,
        )?;
        let builder = AttestationBuilder::new(mock_module_id(seed), mock_measurements(seed), chain);

        info!(
            module_id = builder.module_id(),
            eth_address = %app_key.address(),
            seeded = seed.is_some(),
            "Mock KMS initialized"
        );

        Ok(Self {
            app_key,
            attestation_key,
            builder,
            seeded: seed.is_some(),
        })
    }

    pub fn attestation_builder(&self) -> &AttestationBuilder {
        &self.builder
    }
}

fn mock_module_id(seed: Option<&[u8; 32]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"enclave-bridge/module-id");
    if let Some(seed) = seed {
        hasher.update(seed);
    }
    let digest = hasher.finalize();
    format!("i-{}-enc{}", hex::encode(&digest[..8]), hex::encode(&digest[8..16]))
}

fn mock_measurements(seed: Option<&[u8; 32]>) -> Measurements {
    let mut measurements = Measurements::default();
    for (index, label) in MEASURED_PCRS {
        let mut hasher = Sha384::new();
        hasher.update(label.as_bytes());
        if let Some(seed) = seed {
            hasher.update(seed);
        }
        let mut digest = [0u8; PCR_LENGTH];
        digest.copy_from_slice(&hasher.finalize());
        // indices are below PCR_COUNT
        let _ = measurements.set(index, digest);
    }
    measurements
}

impl KmsService for MockKmsService {
    fn init_crypto(&self) -> Result<CryptoInfo, CryptoError> {
        crypto_info(
            &self.app_key,
            CapabilityFlags {
                nsm_available: false,
                hardware_rng: false,
                deterministic_signing: true,
            },
        )
    }

    fn sign_data(&self, data: &[u8]) -> Result<EthSignature, CryptoError> {
        self.app_key.sign(data)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        self.app_key.decrypt(ciphertext)
    }

    fn generate_key(&self, spec: KeySpec) -> Result<GeneratedKey, CryptoError> {
        generate_with(&self.app_key, spec, |len| self.generate_random(len))
    }

    fn generate_random(&self, length: usize) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = vec![0u8; length];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(bytes)
    }

    fn generate_attestation(&self, request: &AttestationRequest) -> Result<Vec<u8>, AttestationError> {
        let public_key = self.app_key.public_key_der()?;
        let timestamp = Utc::now().timestamp_millis() as u64;
        debug!(
            nonce_len = request.nonce.as_ref().map_or(0, Vec::len),
            user_data_len = request.user_data.as_ref().map_or(0, Vec::len),
            seeded = self.seeded,
            "Building mock attestation"
        );
        self.builder
            .build(&self.attestation_key, request, Some(&public_key), timestamp)
    }

    fn signing_public_key(&self) -> VerifyingKey {
        *self.app_key.verifying_key()
    }

    fn env_setup(&self) -> EnvSetup {
        EnvSetup::Sim
    }
}
