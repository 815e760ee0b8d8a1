//! Fibonacci demo application
//!
//! `/initialize` takes `n` as 32 big-endian bytes and finalizes the enclave
//! with `fib(n)` in the same encoding. `/fibonacci/<n>` answers ad-hoc
//! queries with a signed JSON response.

use crate::codec::{Envelope, Reply};
use crate::enclave::{Application, EnclaveContext, HandlerTable};
use crate::error::HandlerError;
use chrono::Utc;
use serde_json::json;
use tracing::info;

/// Width of the input and result encodings
pub const WORD_BYTES: usize = 32;

/// Largest index whose value fits in a `u128`
pub const MAX_N: u32 = 186;

const ROUTE_PREFIX: &str = "/fibonacci/";

#[derive(Debug, Default, Clone, Copy)]
pub struct FibonacciApp;

pub fn fibonacci(n: u32) -> Result<u128, HandlerError> {
    if n > MAX_N {
        return Err(HandlerError::BadRequest(format!(
            "n must be at most {}, got {}",
            MAX_N, n
        )));
    }

    if n == 0 {
        return Ok(0);
    }

    // stops at fib(n) itself; fib(n + 1) may not fit
    let (mut a, mut b) = (0u128, 1u128);
    for _ in 1..n {
        let next = a.checked_add(b).ok_or_else(|| {
            HandlerError::BadRequest(format!("fib({}) does not fit in 128 bits", n))
        })?;
        a = b;
        b = next;
    }
    Ok(b)
}

/// Reads a 32-byte big-endian word holding a small integer
pub fn decode_word(bytes: &[u8]) -> Result<u32, HandlerError> {
    if bytes.len() != WORD_BYTES {
        return Err(HandlerError::BadRequest(format!(
            "expected {} bytes, got {}",
            WORD_BYTES,
            bytes.len()
        )));
    }

    let (high, low) = bytes.split_at(WORD_BYTES - 4);
    if high.iter().any(|b| *b != 0) {
        return Err(HandlerError::BadRequest(format!("n must be at most {}", MAX_N)));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(low);
    Ok(u32::from_be_bytes(buf))
}

pub fn encode_word(value: u128) -> [u8; WORD_BYTES] {
    let mut out = [0u8; WORD_BYTES];
    out[WORD_BYTES - 16..].copy_from_slice(&value.to_be_bytes());
    out
}

impl Application for FibonacciApp {
    fn name(&self) -> &str {
        "fibonacci"
    }

    fn initialize(&self, ctx: &EnclaveContext, data: &[u8]) -> Result<(), HandlerError> {
        let n = decode_word(data)?;
        let value = fibonacci(n)?;
        info!(n, "Computed fibonacci number");
        ctx.finalize(encode_word(value).to_vec())?;
        Ok(())
    }

    fn register_handlers(&self, table: &mut HandlerTable) {
        table.route_prefix(ROUTE_PREFIX, handle_query);
    }
}

fn handle_query(ctx: &EnclaveContext, request: &Envelope) -> Result<Reply, HandlerError> {
    let raw = request
        .endpoint
        .strip_prefix(ROUTE_PREFIX)
        .unwrap_or_default();
    let n: u32 = raw
        .parse()
        .map_err(|_| HandlerError::BadRequest("invalid number in URL".to_string()))?;
    let value = fibonacci(n)?;

    // u128 does not survive every JSON parser, so the value travels as a string
    let response = json!({
        "enclave_id": ctx.identity().id.to_string(),
        "input": n,
        "result": value.to_string(),
        "timestamp": Utc::now().timestamp(),
    });
    // keys serialize sorted, which is what the signature covers
    let canonical = serde_json::to_vec(&response)
        .map_err(|e| HandlerError::Internal(format!("cannot serialize response: {}", e)))?;
    let signature = ctx.sign(&canonical)?;

    let mut body = response;
    body["signature"] = json!(signature.to_hex());
    Ok(Reply::ok(body))
}
