use enclave_bridge::apps::FibonacciApp;
use enclave_bridge::enclave::{Dispatcher, EnclaveContext};
use enclave_bridge::kms::{KmsService, MockKmsService};
use std::sync::Arc;

pub const SEED: [u8; 32] = [42u8; 32];

pub fn fibonacci_dispatcher() -> Arc<Dispatcher> {
    let kms: Arc<dyn KmsService> = Arc::new(MockKmsService::from_seed(&SEED).unwrap());
    let ctx = Arc::new(EnclaveContext::new(kms, false));
    Arc::new(Dispatcher::new(ctx, Arc::new(FibonacciApp)))
}

/// `n` as a 32-byte big-endian word
pub fn word(n: u8) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[31] = n;
    out
}
