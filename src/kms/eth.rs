//! Ethereum-style secp256k1 signatures
//!
//! Messages are hashed with Keccak-256 and signed deterministically
//! (RFC 6979). Signatures are 65 bytes `r || s || v` with low `s` and
//! `v = recovery_id + 27`, so they recover with `ecrecover`.

use crate::error::CryptoError;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

/// Length of an Ethereum signature in bytes
pub const SIGNATURE_LENGTH: usize = 65;

const V_OFFSET: u8 = 27;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 65-byte recoverable signature, serialized as hex
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EthSignature([u8; SIGNATURE_LENGTH]);

impl EthSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for EthSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EthSignature(0x{})", self.to_hex())
    }
}

impl Serialize for EthSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EthSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Signs `keccak256(data)`
pub fn sign(key: &SigningKey, data: &[u8]) -> Result<EthSignature, CryptoError> {
    let hash = keccak256(data);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&hash)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    // EIP-2: keep s in the lower half of the curve order
    let (signature, recovery_id) = match signature.normalize_s() {
        Some(low) => (
            low,
            RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced()),
        ),
        None => (signature, recovery_id),
    };

    let mut bytes = [0u8; SIGNATURE_LENGTH];
    bytes[..64].copy_from_slice(&signature.to_bytes());
    bytes[64] = recovery_id.to_byte() + V_OFFSET;
    Ok(EthSignature(bytes))
}

/// Recovers the signer of `data` from `signature`
pub fn recover(data: &[u8], signature: &EthSignature) -> Result<VerifyingKey, CryptoError> {
    let v = signature.v();
    let recovery_id = v
        .checked_sub(V_OFFSET)
        .and_then(RecoveryId::from_byte)
        .filter(|id| !id.is_x_reduced())
        .ok_or(CryptoError::Verification)?;

    let sig = Signature::from_slice(&signature.0[..64]).map_err(|_| CryptoError::Verification)?;
    if sig.normalize_s().is_some() {
        return Err(CryptoError::Verification);
    }

    VerifyingKey::recover_from_prehash(&keccak256(data), &sig, recovery_id)
        .map_err(|_| CryptoError::Verification)
}

/// True when `signature` over `data` recovers to `public_key`
pub fn verify(public_key: &VerifyingKey, data: &[u8], signature: &EthSignature) -> bool {
    matches!(recover(data, signature), Ok(recovered) if recovered == *public_key)
}

/// `0x`-prefixed address: last 20 bytes of keccak256 of the uncompressed point
pub fn address(public_key: &VerifyingKey) -> String {
    let point = public_key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}
