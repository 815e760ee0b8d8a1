//! KMS backend for a real Nitro enclave, backed by `/dev/nsm`

use super::{
    crypto_info, generate_with, AppKey, CapabilityFlags, CryptoInfo, EthSignature, GeneratedKey,
    KeySpec, KmsService,
};
use crate::attestation::AttestationRequest;
use crate::config::EnvSetup;
use crate::error::{AttestationError, CryptoError, DecryptError};
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
use k256::ecdsa::VerifyingKey;
use serde_bytes::ByteBuf;
use tracing::{debug, info};

/// Holds an open NSM session for the lifetime of the service
pub struct NitroKmsService {
    fd: i32,
    app_key: AppKey,
    module_id: String,
}

impl std::fmt::Debug for NitroKmsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NitroKmsService")
            .field("module_id", &self.module_id)
            .field("app_key", &self.app_key)
            .finish()
    }
}

impl NitroKmsService {
    /// Opens the NSM and draws the application key from its entropy.
    ///
    /// Fails outside an enclave, where the device does not exist.
    pub fn open() -> Result<Self, CryptoError> {
        let fd = nsm_init();
        if fd < 0 {
            return Err(CryptoError::Nsm(
                "failed to open /dev/nsm; not running inside a Nitro enclave".to_string(),
            ));
        }

        // from here on, Drop closes the session
        let mut service = Self {
            fd,
            app_key: AppKey::random(),
            module_id: String::new(),
        };

        service.module_id = service.describe()?;
        service.app_key = service.draw_app_key()?;

        info!(
            module_id = %service.module_id,
            eth_address = %service.app_key.address(),
            "NSM session opened"
        );
        Ok(service)
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    fn describe(&self) -> Result<String, CryptoError> {
        match nsm_process_request(self.fd, Request::DescribeNSM) {
            Response::DescribeNSM {
                module_id,
                max_pcrs,
                digest,
                ..
            } => {
                debug!(max_pcrs, digest = ?digest, "NSM described");
                Ok(module_id)
            }
            Response::Error(code) => Err(CryptoError::Nsm(format!("DescribeNSM: {:?}", code))),
            _ => Err(CryptoError::Nsm("unexpected response to DescribeNSM".to_string())),
        }
    }

    fn draw_app_key(&self) -> Result<AppKey, CryptoError> {
        for _ in 0..8 {
            let bytes = self.nsm_random(32)?;
            if let Ok(key) = AppKey::from_secret_bytes(&bytes[..32]) {
                return Ok(key);
            }
        }
        Err(CryptoError::KeyGeneration(
            "NSM entropy did not yield a valid secp256k1 scalar".to_string(),
        ))
    }

    /// `GetRandom` returns up to 256 bytes per call, so large draws loop
    fn nsm_random(&self, length: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            match nsm_process_request(self.fd, Request::GetRandom) {
                Response::GetRandom { random } if !random.is_empty() => {
                    let take = (length - out.len()).min(random.len());
                    out.extend_from_slice(&random[..take]);
                }
                Response::GetRandom { .. } => {
                    return Err(CryptoError::Random("NSM returned no entropy".to_string()))
                }
                Response::Error(code) => {
                    return Err(CryptoError::Random(format!("GetRandom: {:?}", code)))
                }
                _ => return Err(CryptoError::Random("unexpected response to GetRandom".to_string())),
            }
        }
        Ok(out)
    }
}

impl KmsService for NitroKmsService {
    fn init_crypto(&self) -> Result<CryptoInfo, CryptoError> {
        crypto_info(
            &self.app_key,
            CapabilityFlags {
                nsm_available: true,
                hardware_rng: true,
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
        generate_with(&self.app_key, spec, |len| self.nsm_random(len))
    }

    fn generate_random(&self, length: usize) -> Result<Vec<u8>, CryptoError> {
        self.nsm_random(length)
    }

    fn generate_attestation(&self, request: &AttestationRequest) -> Result<Vec<u8>, AttestationError> {
        let public_key = self.app_key.public_key_der()?;
        let nsm_request = Request::Attestation {
            user_data: request.user_data.clone().map(ByteBuf::from),
            nonce: request.nonce.clone().map(ByteBuf::from),
            public_key: Some(ByteBuf::from(public_key)),
        };

        match nsm_process_request(self.fd, nsm_request) {
            Response::Attestation { document } => Ok(document),
            Response::Error(code) => Err(AttestationError::Unavailable(format!(
                "NSM attestation failed: {:?}",
                code
            ))),
            _ => Err(AttestationError::Unavailable(
                "unexpected response to Attestation".to_string(),
            )),
        }
    }

    fn signing_public_key(&self) -> VerifyingKey {
        *self.app_key.verifying_key()
    }

    fn env_setup(&self) -> EnvSetup {
        EnvSetup::Nitro
    }
}

impl Drop for NitroKmsService {
    fn drop(&mut self) {
        nsm_exit(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_fails_without_nsm_device() {
        if std::path::Path::new("/dev/nsm").exists() {
            return;
        }
        assert!(matches!(NitroKmsService::open(), Err(CryptoError::Nsm(_))));
    }
}
