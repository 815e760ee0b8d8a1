//! Nitro-compatible attestation documents
//!
//! A document is a CBOR payload wrapped in a tagged COSE_Sign1 structure:
//!
//! ```text
//! Tag(18, [ protected: bstr({1: -35}), unprotected: {}, payload: bstr, signature: bstr ])
//! ```
//!
//! The payload carries the module id, the SHA-384 measurement registers
//! (PCR0..PCR15), a millisecond timestamp, the signing certificate with its CA
//! bundle and the optional public key / user data / nonce. The signature is
//! ES384 (P-384, SHA-384) over the COSE `Sig_structure`, so documents produced
//! here verify with the same tooling as documents produced by the Nitro Secure
//! Module. The validity window of a document is the validity of its leaf
//! certificate.

use crate::error::{AttestationError, CryptoError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Datelike, Duration, Utc};
use ciborium::value::Value;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P384_SHA384,
};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair as _, UnparsedPublicKey, ECDSA_P384_SHA384_FIXED,
    ECDSA_P384_SHA384_FIXED_SIGNING,
};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use x509_parser::prelude::{parse_x509_certificate, ASN1Time, X509Certificate};

/// Number of measurement registers in a document
pub const PCR_COUNT: u16 = 16;

/// Length of a SHA-384 measurement register
pub const PCR_LENGTH: usize = 48;

/// CBOR tag of a COSE_Sign1 message
pub const COSE_SIGN1_TAG: u64 = 18;

/// COSE algorithm identifier for ECDSA P-384 / SHA-384
pub const COSE_ALG_ES384: i64 = -35;

const COSE_HEADER_ALG: i64 = 1;
const ES384_SIGNATURE_LEN: usize = 96;

/// Digest used for the measurement registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA384")]
    Sha384,
}

/// Caller-supplied freshness and binding data for a document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestationRequest {
    pub nonce: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
}

impl AttestationRequest {
    pub fn with_nonce(nonce: impl Into<Vec<u8>>) -> Self {
        Self {
            nonce: Some(nonce.into()),
            user_data: None,
        }
    }
}

/// Decoded attestation payload. Field order matches the NSM encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub module_id: String,
    pub digest: DigestAlgorithm,
    pub timestamp: u64,
    pub pcrs: BTreeMap<u16, ByteBuf>,
    pub certificate: ByteBuf,
    pub cabundle: Vec<ByteBuf>,
    #[serde(default)]
    pub public_key: Option<ByteBuf>,
    #[serde(default)]
    pub user_data: Option<ByteBuf>,
    #[serde(default)]
    pub nonce: Option<ByteBuf>,
}

impl AttestationDocument {
    pub fn to_cbor(&self) -> Result<Vec<u8>, AttestationError> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| AttestationError::Encoding(e.to_string()))?;
        Ok(out)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, AttestationError> {
        ciborium::from_reader(bytes).map_err(|e| AttestationError::Malformed(e.to_string()))
    }

    /// Decodes the payload of a COSE_Sign1 document without checking its signature
    pub fn from_cose(bytes: &[u8]) -> Result<Self, AttestationError> {
        let cose = CoseSign1::from_slice(bytes)?;
        Self::from_cbor(&cose.payload)
    }

    /// Checks the register layout: 16 slots, each a 48-byte digest
    pub fn validate(&self) -> Result<(), AttestationError> {
        if self.pcrs.len() != PCR_COUNT as usize {
            return Err(AttestationError::Malformed(format!(
                "expected {} PCRs, found {}",
                PCR_COUNT,
                self.pcrs.len()
            )));
        }
        for (index, value) in &self.pcrs {
            if *index >= PCR_COUNT {
                return Err(AttestationError::Malformed(format!(
                    "PCR index {} out of range",
                    index
                )));
            }
            if value.len() != PCR_LENGTH {
                return Err(AttestationError::Malformed(format!(
                    "PCR{} has {} bytes, expected {}",
                    index,
                    value.len(),
                    PCR_LENGTH
                )));
            }
        }
        Ok(())
    }
}

/// The sixteen measurement registers. Unset registers are zero-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurements([[u8; PCR_LENGTH]; PCR_COUNT as usize]);

impl Default for Measurements {
    fn default() -> Self {
        Self([[0u8; PCR_LENGTH]; PCR_COUNT as usize])
    }
}

impl Measurements {
    pub fn set(&mut self, index: u16, digest: [u8; PCR_LENGTH]) -> Result<(), AttestationError> {
        let slot = self
            .0
            .get_mut(index as usize)
            .ok_or_else(|| AttestationError::Encoding(format!("PCR index {} out of range", index)))?;
        *slot = digest;
        Ok(())
    }

    pub fn get(&self, index: u16) -> Option<&[u8; PCR_LENGTH]> {
        self.0.get(index as usize)
    }

    pub fn to_map(&self) -> BTreeMap<u16, ByteBuf> {
        self.0
            .iter()
            .enumerate()
            .map(|(index, digest)| (index as u16, ByteBuf::from(digest.to_vec())))
            .collect()
    }
}

/// Produces the detached signature of a COSE_Sign1 message
pub trait CoseSigner: Send + Sync {
    /// COSE algorithm identifier placed in the protected header
    fn algorithm(&self) -> i64;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// ES384 signer backed by a P-384 key pair
pub struct Es384Signer {
    key_pair: EcdsaKeyPair,
    pkcs8: Vec<u8>,
    rng: SystemRandom,
}

impl std::fmt::Debug for Es384Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Es384Signer")
            .field("public_key", &hex::encode(self.public_point()))
            .finish_non_exhaustive()
    }
}

impl Es384Signer {
    /// Generates a fresh P-384 key pair from the system random source
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &rng)
            .map_err(|e| CryptoError::KeyGeneration(format!("P-384 key: {}", e)))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Loads a PKCS#8 (DER) P-384 private key
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|e| CryptoError::InvalidKey(format!("P-384 key: {}", e)))?;
        Ok(Self {
            key_pair,
            pkcs8: pkcs8.to_vec(),
            rng,
        })
    }

    /// Uncompressed SEC1 public point
    pub fn public_point(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    pub(crate) fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }
}

impl CoseSigner for Es384Signer {
    fn algorithm(&self) -> i64 {
        COSE_ALG_ES384
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key_pair
            .sign(&self.rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|e| CryptoError::Signing(format!("ES384: {}", e)))
    }
}

/// A COSE_Sign1 message as emitted by the NSM
#[derive(Debug, Clone, PartialEq)]
pub struct CoseSign1 {
    pub protected: Vec<u8>,
    pub unprotected: Vec<(Value, Value)>,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl CoseSign1 {
    /// Signs `payload` and returns the message
    pub fn sign(payload: Vec<u8>, signer: &dyn CoseSigner) -> Result<Self, AttestationError> {
        let protected = encode_value(&Value::Map(vec![(
            Value::Integer(COSE_HEADER_ALG.into()),
            Value::Integer(signer.algorithm().into()),
        )]))?;
        let to_be_signed = sig_structure(&protected, &payload)?;
        let signature = signer.sign(&to_be_signed)?;

        Ok(Self {
            protected,
            unprotected: Vec::new(),
            payload,
            signature,
        })
    }

    /// Serializes the message wrapped in tag 18
    pub fn to_vec(&self) -> Result<Vec<u8>, AttestationError> {
        let message = Value::Tag(
            COSE_SIGN1_TAG,
            Box::new(Value::Array(vec![
                Value::Bytes(self.protected.clone()),
                Value::Map(self.unprotected.clone()),
                Value::Bytes(self.payload.clone()),
                Value::Bytes(self.signature.clone()),
            ])),
        );
        encode_value(&message)
    }

    /// Parses a tagged or untagged COSE_Sign1 message
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AttestationError> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| AttestationError::Malformed(format!("not CBOR: {}", e)))?;

        let array = match value {
            Value::Tag(COSE_SIGN1_TAG, inner) => *inner,
            Value::Tag(tag, _) => {
                return Err(AttestationError::Malformed(format!("unexpected CBOR tag {}", tag)))
            }
            other => other,
        };

        let mut items = match array {
            Value::Array(items) if items.len() == 4 => items.into_iter(),
            _ => {
                return Err(AttestationError::Malformed(
                    "COSE_Sign1 must be a 4-element array".to_string(),
                ))
            }
        };

        let protected = match items.next() {
            Some(Value::Bytes(bytes)) => bytes,
            _ => {
                return Err(AttestationError::Malformed(
                    "protected headers must be a byte string".into(),
                ))
            }
        };
        let unprotected = match items.next() {
            Some(Value::Map(entries)) => entries,
            _ => {
                return Err(AttestationError::Malformed(
                    "unprotected headers must be a map".to_string(),
                ))
            }
        };
        let payload = match items.next() {
            Some(Value::Bytes(bytes)) => bytes,
            _ => return Err(AttestationError::Malformed("payload must be a byte string".into())),
        };
        let signature = match items.next() {
            Some(Value::Bytes(bytes)) => bytes,
            _ => {
                return Err(AttestationError::Malformed(
                    "signature must be a byte string".into(),
                ))
            }
        };

        Ok(Self {
            protected,
            unprotected,
            payload,
            signature,
        })
    }

    /// Algorithm identifier from the protected header
    pub fn algorithm(&self) -> Result<i64, AttestationError> {
        if self.protected.is_empty() {
            return Err(AttestationError::Malformed("empty protected header".into()));
        }
        let header: Value = ciborium::from_reader(&self.protected[..])
            .map_err(|e| AttestationError::Malformed(format!("protected header: {}", e)))?;
        let entries = match header {
            Value::Map(entries) => entries,
            _ => return Err(AttestationError::Malformed("protected header is not a map".into())),
        };

        entries
            .iter()
            .find_map(|(key, value)| match (key, value) {
                (Value::Integer(k), Value::Integer(v)) if i128::from(*k) == COSE_HEADER_ALG as i128 => {
                    i64::try_from(i128::from(*v)).ok()
                }
                _ => None,
            })
            .ok_or_else(|| AttestationError::Malformed("protected header has no alg".into()))
    }

    /// Verifies the ES384 signature against an uncompressed P-384 point
    pub fn verify_es384(&self, public_point: &[u8]) -> Result<(), AttestationError> {
        let alg = self.algorithm()?;
        if alg != COSE_ALG_ES384 {
            return Err(AttestationError::Verification(format!(
                "unsupported algorithm {}",
                alg
            )));
        }
        if self.signature.len() != ES384_SIGNATURE_LEN {
            return Err(AttestationError::Verification(format!(
                "signature has {} bytes, expected {}",
                self.signature.len(),
                ES384_SIGNATURE_LEN
            )));
        }

        let to_be_signed = sig_structure(&self.protected, &self.payload)?;
        UnparsedPublicKey::new(&ECDSA_P384_SHA384_FIXED, public_point)
            .verify(&to_be_signed, &self.signature)
            .map_err(|_| AttestationError::Verification("COSE signature mismatch".into()))
    }
}

/// `["Signature1", protected, external_aad = h'', payload]`
fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>, AttestationError> {
    encode_value(&Value::Array(vec![
        Value::Text("Signature1".to_string()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]))
}

fn encode_value(value: &Value) -> Result<Vec<u8>, AttestationError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| AttestationError::Encoding(e.to_string()))?;
    Ok(out)
}

/// Leaf certificate plus its CA bundle (root first), all DER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    pub leaf: Vec<u8>,
    pub cabundle: Vec<Vec<u8>>,
}

impl CertificateChain {
    /// Issues a root CA and a leaf certificate for `signer`'s key.
    ///
    /// The leaf is valid from the start of yesterday (UTC) for `validity_days`.
    pub fn issue(
        signer: &Es384Signer,
        subject: &str,
        validity_days: i64,
    ) -> Result<Self, CryptoError> {
        let cert_err = |e: rcgen::Error| CryptoError::KeyGeneration(format!("certificate: {}", e));

        let now = Utc::now();
        let (nb_year, nb_month, nb_day) = ymd(now - Duration::days(1));
        let (na_year, na_month, na_day) = ymd(now + Duration::days(validity_days));
        let not_before = rcgen::date_time_ymd(nb_year, nb_month, nb_day);
        let not_after = rcgen::date_time_ymd(na_year, na_month, na_day);

        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).map_err(cert_err)?;
        let mut root_params = CertificateParams::new(Vec::<String>::new()).map_err(cert_err)?;
        root_params.distinguished_name = distinguished_name("enclave-bridge mock root CA");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.not_before = not_before;
        root_params.not_after = not_after;
        let root = root_params.self_signed(&root_key).map_err(cert_err)?;

        let leaf_key = KeyPair::try_from(signer.pkcs8()).map_err(cert_err)?;
        let mut leaf_params = CertificateParams::new(Vec::<String>::new()).map_err(cert_err)?;
        leaf_params.distinguished_name = distinguished_name(subject);
        leaf_params.not_before = not_before;
        leaf_params.not_after = not_after;
        let leaf = leaf_params
            .signed_by(&leaf_key, &root, &root_key)
            .map_err(cert_err)?;

        Ok(Self {
            leaf: leaf.der().to_vec(),
            cabundle: vec![root.der().to_vec()],
        })
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "enclave-bridge");
    dn
}

fn ymd(at: DateTime<Utc>) -> (i32, u8, u8) {
    (at.year(), at.month() as u8, at.day() as u8)
}

/// Assembles and signs documents for the emulated attestation backend
#[derive(Debug, Clone)]
pub struct AttestationBuilder {
    module_id: String,
    measurements: Measurements,
    chain: CertificateChain,
}

impl AttestationBuilder {
    pub fn new(module_id: impl Into<String>, measurements: Measurements, chain: CertificateChain) -> Self {
        Self {
            module_id: module_id.into(),
            measurements,
            chain,
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    /// Builds the payload for `request` without signing it
    pub fn payload(
        &self,
        request: &AttestationRequest,
        public_key: Option<&[u8]>,
        timestamp_ms: u64,
    ) -> AttestationDocument {
        AttestationDocument {
            module_id: self.module_id.clone(),
            digest: DigestAlgorithm::Sha384,
            timestamp: timestamp_ms,
            pcrs: self.measurements.to_map(),
            certificate: ByteBuf::from(self.chain.leaf.clone()),
            cabundle: self.chain.cabundle.iter().cloned().map(ByteBuf::from).collect(),
            public_key: public_key.map(|pk| ByteBuf::from(pk.to_vec())),
            user_data: request.user_data.clone().map(ByteBuf::from),
            nonce: request.nonce.clone().map(ByteBuf::from),
        }
    }

    /// Encodes the payload, signs it and returns the tagged COSE_Sign1 bytes
    pub fn build(
        &self,
        signer: &dyn CoseSigner,
        request: &AttestationRequest,
        public_key: Option<&[u8]>,
        timestamp_ms: u64,
    ) -> Result<Vec<u8>, AttestationError> {
        let payload = self.payload(request, public_key, timestamp_ms).to_cbor()?;
        CoseSign1::sign(payload, signer)?.to_vec()
    }
}

/// Verifies a document end to end and returns its payload.
///
/// Checks the register layout, the COSE signature against the leaf
/// certificate's key, each certificate against its issuer in the CA bundle,
/// and that the document timestamp falls inside the leaf validity window.
pub fn verify_document(bytes: &[u8]) -> Result<AttestationDocument, AttestationError> {
    let cose = CoseSign1::from_slice(bytes)?;
    let document = AttestationDocument::from_cbor(&cose.payload)?;
    document.validate()?;

    let leaf = parse_certificate(&document.certificate, "leaf")?;
    cose.verify_es384(&leaf.public_key().subject_public_key.data)?;

    let bundle = document
        .cabundle
        .iter()
        .enumerate()
        .map(|(i, der)| parse_certificate(der, &format!("cabundle[{}]", i)))
        .collect::<Result<Vec<_>, _>>()?;

    let root = bundle
        .first()
        .ok_or_else(|| AttestationError::Verification("empty CA bundle".into()))?;
    root.verify_signature(None)
        .map_err(|e| AttestationError::Verification(format!("root certificate: {}", e)))?;

    let mut issuer = root;
    for (i, cert) in bundle.iter().enumerate().skip(1) {
        cert.verify_signature(Some(issuer.public_key()))
            .map_err(|e| AttestationError::Verification(format!("cabundle[{}]: {}", i, e)))?;
        issuer = cert;
    }
    leaf.verify_signature(Some(issuer.public_key()))
        .map_err(|e| AttestationError::Verification(format!("leaf certificate: {}", e)))?;

    let issued_at = ASN1Time::from_timestamp((document.timestamp / 1000) as i64)
        .map_err(|e| AttestationError::Malformed(format!("timestamp: {}", e)))?;
    if !leaf.validity().is_valid_at(issued_at) {
        return Err(AttestationError::Verification(
            "document timestamp outside certificate validity".into(),
        ));
    }

    Ok(document)
}

fn parse_certificate<'a>(der: &'a [u8], name: &str) -> Result<X509Certificate<'a>, AttestationError> {
    parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| AttestationError::Malformed(format!("{} certificate: {}", name, e)))
}

/// One register of a formatted document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedPcr {
    pub value: String,
    pub description: String,
}

/// Human-readable rendering of a document for `/formatted-attest`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedAttestation {
    pub module_id: String,
    pub digest: DigestAlgorithm,
    pub pcrs: BTreeMap<String, FormattedPcr>,
    pub active_pcrs: Vec<u16>,
    pub certificate: String,
    pub cabundle: Vec<String>,
    pub public_key: Option<String>,
    pub timestamp: u64,
    pub timestamp_formatted: String,
    pub nonce: Option<String>,
    pub user_data: Option<String>,
}

impl FormattedAttestation {
    pub fn from_document(document: &AttestationDocument) -> Self {
        let pcrs = document
            .pcrs
            .iter()
            .map(|(index, value)| {
                (
                    index.to_string(),
                    FormattedPcr {
                        value: hex::encode(value),
                        description: pcr_description(*index).to_string(),
                    },
                )
            })
            .collect();

        let active_pcrs = document
            .pcrs
            .iter()
            .filter(|(_, value)| value.iter().any(|b| *b != 0))
            .map(|(index, _)| *index)
            .collect();

        let timestamp_formatted = DateTime::from_timestamp_millis(document.timestamp as i64)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_default();

        Self {
            module_id: document.module_id.clone(),
            digest: document.digest,
            pcrs,
            active_pcrs,
            certificate: BASE64.encode(&document.certificate),
            cabundle: document.cabundle.iter().map(hex::encode).collect(),
            public_key: document.public_key.as_ref().map(|pk| BASE64.encode(pk)),
            timestamp: document.timestamp,
            timestamp_formatted,
            nonce: document
                .nonce
                .as_ref()
                .map(|n| String::from_utf8_lossy(n).into_owned()),
            user_data: document
                .user_data
                .as_ref()
                .map(|d| String::from_utf8_lossy(d).into_owned()),
        }
    }
}

fn pcr_description(index: u16) -> &'static str {
    match index {
        0 => "Enclave image file",
        1 => "Linux kernel and bootstrap",
        2 => "Application",
        3 => "IAM role of the parent instance",
        4 => "Instance ID of the parent instance",
        8 => "Enclave image signing certificate",
        _ => "Unused PCR",
    }
}
