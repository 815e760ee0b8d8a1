//! Enclave Bridge - parent/enclave communication and attestation for AWS Nitro Enclaves
//!
//! This library provides:
//! - A length-prefixed JSON envelope protocol over TCP, vsock or HTTP
//! - A pluggable KMS service (NSM-backed or mock) for signing, ECIES
//!   decryption, randomness and attestation documents
//! - COSE_Sign1 attestation building, parsing and verification
//! - An enclave dispatcher with a lifecycle state machine and signed results
//! - A parent-side proxy that forwards HTTP calls into the enclave

pub mod apps;
pub mod attestation;
pub mod client;
pub mod codec;
pub mod config;
pub mod connector;
pub mod enclave;
pub mod error;
pub mod kms;
pub mod logging;
pub mod parent;
pub mod transport;

pub use error::{EnclaveError, Result};
