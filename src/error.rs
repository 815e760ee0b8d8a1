//! Error types for the enclave bridge

use thiserror::Error;

/// Errors raised while decoding a length-prefixed envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("truncated frame: expected {expected} bytes, got {available}")]
    Truncated { expected: usize, available: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Connection-level failures of a transport connector
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("connector already running")]
    AlreadyRunning,

    #[error("unsupported transport: {0}")]
    Unsupported(String),

    #[error("enclave unreachable after {0} attempts")]
    Unreachable(u32),
}

/// ECIES decryption failures. Never carries partial plaintext.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("ciphertext is malformed: {0}")]
    Malformed(String),

    #[error("ciphertext does not match the enclave key")]
    Mismatch,
}

/// Signing, key generation and randomness failures
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("NSM error: {0}")]
    Nsm(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signature verification failed")]
    Verification,

    #[error("random generation failed: {0}")]
    Random(String),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures to obtain, build, parse or verify an attestation document
#[derive(Error, Debug)]
pub enum AttestationError {
    #[error("attestation unavailable: {0}")]
    Unavailable(String),

    #[error("attestation encoding error: {0}")]
    Encoding(String),

    #[error("attestation document is malformed: {0}")]
    Malformed(String),

    #[error("attestation verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors returned by request handlers; converted into error replies by the dispatcher
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("enclave already finalized")]
    AlreadyFinalized,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),
}

impl HandlerError {
    /// HTTP-style status code reported alongside the error reply
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::BadRequest(_) => 400,
            HandlerError::AlreadyFinalized | HandlerError::Conflict(_) => 409,
            HandlerError::Attestation(_) => 503,
            HandlerError::Internal(_) | HandlerError::Crypto(_) => 500,
        }
    }
}

/// Top-level errors for building and running an enclave process
#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EnclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_map_to_status_codes() {
        assert_eq!(HandlerError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(HandlerError::AlreadyFinalized.status_code(), 409);
        assert_eq!(
            HandlerError::Attestation(AttestationError::Unavailable("no nsm".into())).status_code(),
            503
        );
        assert_eq!(
            HandlerError::Crypto(CryptoError::Signing("boom".into())).status_code(),
            500
        );
    }

    #[test]
    fn attestation_unavailable_message() {
        let err = AttestationError::Unavailable("NSM closed".into());
        assert_eq!(err.to_string(), "attestation unavailable: NSM closed");
    }
}
