//! Applications shipped with the enclave server

pub mod fibonacci;

pub use fibonacci::FibonacciApp;
