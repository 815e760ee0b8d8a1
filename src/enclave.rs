//! Enclave request dispatcher and lifecycle
//!
//! The dispatcher routes every request envelope either to one of the built-in
//! endpoints or to the application's handler table:
//!
//! - `/initialize`: hands base64 `data` to [`Application::initialize`]
//! - `/status`, `/settlement`: lifecycle plus the signed result, if any
//! - `/attest`, `/formatted-attest`: attestation document, raw or readable
//! - `/kms`: decrypt, key generation and randomness through the enclave KMS
//! - `/health`, `/public-key`
//!
//! The enclave moves through `Uninitialized -> Initialized -> Running ->
//! Finalized`. Once finalized, its result and signature never change.

use crate::attestation::{AttestationDocument, AttestationRequest, FormattedAttestation};
use crate::codec::{Envelope, Reply};
use crate::connector::RequestHandler;
use crate::error::{CryptoError, HandlerError};
use crate::kms::{EthSignature, KeySpec, KmsService};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Running,
    Finalized,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Running => "running",
            Lifecycle::Finalized => "finalized",
        }
    }
}

/// Who this enclave is; fixed at startup
#[derive(Debug, Clone)]
pub struct EnclaveIdentity {
    pub id: Uuid,
    /// Uncompressed secp256k1 point of the signing key
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// The final output of a computation and the enclave's signature over it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveResult {
    pub raw_bytes: Vec<u8>,
    pub signature: EthSignature,
}

#[derive(Debug)]
struct State {
    lifecycle: Lifecycle,
    result: Option<EnclaveResult>,
}

/// Shared state handed to application code
pub struct EnclaveContext {
    identity: EnclaveIdentity,
    kms: Arc<dyn KmsService>,
    debug_mode: bool,
    state: Mutex<State>,
}

impl EnclaveContext {
    pub fn new(kms: Arc<dyn KmsService>, debug_mode: bool) -> Self {
        let identity = EnclaveIdentity {
            id: Uuid::new_v4(),
            public_key: kms
                .signing_public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            created_at: Utc::now(),
        };
        info!(enclave_id = %identity.id, debug_mode, "Enclave context created");

        Self {
            identity,
            kms,
            debug_mode,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Uninitialized,
                result: None,
            }),
        }
    }

    pub fn identity(&self) -> &EnclaveIdentity {
        &self.identity
    }

    pub fn kms(&self) -> &dyn KmsService {
        self.kms.as_ref()
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state().lifecycle
    }

    pub fn result(&self) -> Option<EnclaveResult> {
        self.state().result.clone()
    }

    /// Lifecycle and result read under one lock
    pub fn snapshot(&self) -> (Lifecycle, Option<EnclaveResult>) {
        let state = self.state();
        (state.lifecycle, state.result.clone())
    }

    pub fn sign(&self, data: &[u8]) -> Result<EthSignature, CryptoError> {
        self.kms.sign_data(data)
    }

    /// Signs `raw_bytes`, stores the result and moves to `Finalized`.
    ///
    /// Returns `Ok(false)` without touching the stored result when the
    /// enclave was already finalized.
    pub fn finalize(&self, raw_bytes: Vec<u8>) -> Result<bool, HandlerError> {
        if self.lifecycle() == Lifecycle::Finalized {
            return Ok(false);
        }

        let signature = self.kms.sign_data(&raw_bytes)?;

        let mut state = self.state();
        if state.lifecycle == Lifecycle::Finalized {
            return Ok(false);
        }
        info!(
            enclave_id = %self.identity.id,
            result_len = raw_bytes.len(),
            "Enclave finalized"
        );
        state.result = Some(EnclaveResult {
            raw_bytes,
            signature,
        });
        state.lifecycle = Lifecycle::Finalized;
        Ok(true)
    }

    /// Moves `from -> to`; false if the current state is not `from`
    fn advance(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let mut state = self.state();
        if state.lifecycle == from {
            state.lifecycle = to;
            true
        } else {
            false
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Upper bound for `/kms` `genrandom`
pub const MAX_RANDOM_BYTES: usize = 1024;

const DEFAULT_RANDOM_BYTES: usize = 32;

/// Custom endpoint handler
pub type Handler =
    Arc<dyn Fn(&EnclaveContext, &Envelope) -> Result<Reply, HandlerError> + Send + Sync>;

/// Endpoint table: exact paths first, then the longest matching prefix
#[derive(Default, Clone)]
pub struct HandlerTable {
    exact: HashMap<String, Handler>,
    prefixes: Vec<(String, Handler)>,
}

impl HandlerTable {
    pub fn route<F>(&mut self, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&EnclaveContext, &Envelope) -> Result<Reply, HandlerError> + Send + Sync + 'static,
    {
        self.exact.insert(path.into(), Arc::new(handler));
        self
    }

    pub fn route_prefix<F>(&mut self, prefix: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&EnclaveContext, &Envelope) -> Result<Reply, HandlerError> + Send + Sync + 'static,
    {
        self.prefixes.push((prefix.into(), Arc::new(handler)));
        self
    }

    pub fn resolve(&self, endpoint: &str) -> Option<&Handler> {
        self.exact.get(endpoint).or_else(|| {
            self.prefixes
                .iter()
                .filter(|(prefix, _)| endpoint.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, handler)| handler)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

/// Application logic running inside the enclave
pub trait Application: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Consumes the init payload. May call [`EnclaveContext::finalize`].
    fn initialize(&self, ctx: &EnclaveContext, data: &[u8]) -> Result<(), HandlerError>;

    fn register_handlers(&self, _table: &mut HandlerTable) {}
}

pub struct Dispatcher {
    ctx: Arc<EnclaveContext>,
    app: Arc<dyn Application>,
    handlers: HandlerTable,
    init_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EnclaveContext>, app: Arc<dyn Application>) -> Self {
        let mut handlers = HandlerTable::default();
        app.register_handlers(&mut handlers);
        info!(app = app.name(), custom_handlers = !handlers.is_empty(), "Dispatcher ready");

        Self {
            ctx,
            app,
            handlers,
            init_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<EnclaveContext> {
        &self.ctx
    }

    pub fn handle_request(&self, request: Envelope) -> Reply {
        let endpoint = if request.endpoint.starts_with('/') {
            request.endpoint.clone()
        } else {
            format!("/{}", request.endpoint)
        };

        let result = match endpoint.as_str() {
            "/initialize" => self.initialize(&request.data),
            "/status" | "/settlement" => self.status(),
            "/attest" => self.attest(&request.data),
            "/formatted-attest" => self.formatted_attest(&request.data),
            "/health" => Ok(self.health()),
            "/public-key" => self.public_key(),
            "/kms" => self.kms(&request.data),
            _ => self.custom(&endpoint, &request),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                let status = e.status_code();
                if status >= 500 {
                    error!(endpoint = %endpoint, error = %e, "Request failed");
                } else {
                    warn!(endpoint = %endpoint, error = %e, "Request rejected");
                }
                Reply::error(status, e.to_string())
            }
        }
    }

    fn initialize(&self, data: &Value) -> Result<Reply, HandlerError> {
        let _serialized = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.ctx.lifecycle() {
            Lifecycle::Uninitialized => {}
            Lifecycle::Finalized => return Err(HandlerError::AlreadyFinalized),
            Lifecycle::Initialized | Lifecycle::Running => {
                return Err(HandlerError::Conflict("enclave already initialized".to_string()))
            }
        }

        let encoded = data.get("data").and_then(Value::as_str).ok_or_else(|| {
            HandlerError::BadRequest(
                "request must include a 'data' field with base64-encoded bytes".to_string(),
            )
        })?;
        let raw_bytes = BASE64
            .decode(encoded)
            .map_err(|e| HandlerError::BadRequest(format!("failed to decode base64 data: {}", e)))?;

        self.app.initialize(&self.ctx, &raw_bytes)?;
        // the application may have finalized already
        self.ctx.advance(Lifecycle::Uninitialized, Lifecycle::Initialized);

        let lifecycle = self.ctx.lifecycle();
        info!(
            app = self.app.name(),
            input_len = raw_bytes.len(),
            lifecycle = lifecycle.as_str(),
            "Enclave initialized"
        );
        Ok(Reply::ok(json!({
            "status": "success",
            "message": "Successfully initialized with provided data",
            "lifecycle": lifecycle,
        })))
    }

    fn status(&self) -> Result<Reply, HandlerError> {
        let (lifecycle, result) = self.ctx.snapshot();

        let (result_b64, signature_b64) = match &result {
            Some(r) => (BASE64.encode(&r.raw_bytes), BASE64.encode(r.signature.as_bytes())),
            None => (String::new(), String::new()),
        };
        let computation_status = if result.is_some() { "completed" } else { "running" };

        Ok(Reply::ok(json!({
            "status": "success",
            "computation_status": computation_status,
            "lifecycle": lifecycle,
            "timestamp": Utc::now().timestamp(),
            "debug_mode": self.ctx.debug_mode(),
            "enclave_id": self.ctx.identity().id.to_string(),
            "result": result_b64,
            "signature": signature_b64,
        })))
    }

    /// Absent or null fields are omitted; anything but a string is rejected
    fn attestation_request(data: &Value) -> Result<AttestationRequest, HandlerError> {
        let field = |name: &str| match data.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_bytes().to_vec())),
            Some(other) => Err(HandlerError::BadRequest(format!(
                "'{}' must be a string, got {}",
                name, other
            ))),
        };
        Ok(AttestationRequest {
            nonce: field("nonce")?,
            user_data: field("user_data")?,
        })
    }

    fn attest(&self, data: &Value) -> Result<Reply, HandlerError> {
        let request = Self::attestation_request(data)?;
        let document = self.ctx.kms().generate_attestation(&request)?;
        debug!(document_len = document.len(), "Attestation generated");

        Ok(Reply::ok(json!({
            "status": "success",
            "attestation": {
                "attestation_doc": BASE64.encode(&document),
                "timestamp": Utc::now().timestamp(),
                "enclave_id": self.ctx.identity().id.to_string(),
                "nonce": request.nonce.map(|n| String::from_utf8_lossy(&n).into_owned()),
            },
        })))
    }

    fn formatted_attest(&self, data: &Value) -> Result<Reply, HandlerError> {
        let request = Self::attestation_request(data)?;
        let document = self.ctx.kms().generate_attestation(&request)?;
        let parsed = AttestationDocument::from_cose(&document)?;
        let formatted = FormattedAttestation::from_document(&parsed);
        debug!(active_pcrs = ?formatted.active_pcrs, "Attestation formatted");

        Ok(Reply::ok(json!({
            "status": "success",
            "attestation": formatted,
        })))
    }

    fn health(&self) -> Reply {
        Reply::ok(json!({
            "status": "ok",
            "lifecycle": self.ctx.lifecycle(),
            "enclave_id": self.ctx.identity().id.to_string(),
            "created_at": self.ctx.identity().created_at.to_rfc3339(),
        }))
    }

    fn public_key(&self) -> Result<Reply, HandlerError> {
        let info = self.ctx.kms().init_crypto()?;
        Ok(Reply::ok(json!({
            "status": "success",
            "public_key": format!("0x{}", hex::encode(&self.ctx.identity().public_key)),
            "public_key_pem": info.public_key_pem,
            "eth_address": info.eth_address,
            "capabilities": info.capabilities,
        })))
    }

    fn kms(&self, data: &Value) -> Result<Reply, HandlerError> {
        let operation = data.get("operation").and_then(Value::as_str).ok_or_else(|| {
            HandlerError::BadRequest("request must include an 'operation' field".to_string())
        })?;
        let kms = self.ctx.kms();

        let body = match operation {
            "decrypt" => {
                let encoded = data
                    .get("encrypted_data")
                    .or_else(|| data.get("ciphertext"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        HandlerError::BadRequest(
                            "decrypt needs base64 'encrypted_data'".to_string(),
                        )
                    })?;
                let ciphertext = BASE64.decode(encoded).map_err(|e| {
                    HandlerError::BadRequest(format!("failed to decode base64 data: {}", e))
                })?;
                // a ciphertext the enclave cannot open is the caller's mistake
                let plaintext = kms
                    .decrypt(&ciphertext)
                    .map_err(|e| HandlerError::BadRequest(e.to_string()))?;
                json!({ "plaintext": BASE64.encode(plaintext) })
            }
            "genkey" => {
                let name = data.get("key_spec").and_then(Value::as_str).unwrap_or("AES_256");
                let spec: KeySpec = name
                    .parse()
                    .map_err(|e: CryptoError| HandlerError::BadRequest(e.to_string()))?;
                let key = kms.generate_key(spec)?;
                json!({
                    "key_spec": name,
                    "private_key": BASE64.encode(&key.private_key),
                    "public_key": BASE64.encode(&key.public_key),
                })
            }
            "genrandom" => {
                let length = match data.get("length") {
                    None | Some(Value::Null) => DEFAULT_RANDOM_BYTES,
                    Some(value) => value
                        .as_u64()
                        .and_then(|n| usize::try_from(n).ok())
                        .filter(|n| (1..=MAX_RANDOM_BYTES).contains(n))
                        .ok_or_else(|| {
                            HandlerError::BadRequest(format!(
                                "length must be between 1 and {}",
                                MAX_RANDOM_BYTES
                            ))
                        })?,
                };
                let random = kms.generate_random(length)?;
                json!({ "length": length, "random": BASE64.encode(random) })
            }
            other => {
                return Err(HandlerError::BadRequest(format!(
                    "unsupported KMS operation: {}",
                    other
                )))
            }
        };
        debug!(operation, "KMS operation served");

        let mut reply = json!({ "status": "success", "operation": operation });
        if let (Some(reply), Value::Object(fields)) = (reply.as_object_mut(), body) {
            reply.extend(fields);
        }
        Ok(Reply::ok(reply))
    }

    fn custom(&self, endpoint: &str, request: &Envelope) -> Result<Reply, HandlerError> {
        let Some(handler) = self.handlers.resolve(endpoint) else {
            return Ok(Reply::ok(json!({
                "status": "success",
                "message": format!("{} received request at {}", self.app.name(), endpoint),
                "data": request.data,
            })));
        };

        if self.ctx.lifecycle() == Lifecycle::Finalized {
            return Err(HandlerError::AlreadyFinalized);
        }

        let reply = handler(self.ctx.as_ref(), request)?;
        if reply.is_success() {
            self.ctx.advance(Lifecycle::Initialized, Lifecycle::Running);
        }
        Ok(reply)
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, request: Envelope) -> Reply {
        self.handle_request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::verify_document;
    use crate::kms::{eth, seal_to, MockKmsService};

    /// Stores the init payload as its result on initialize
    struct EchoApp;

    impl Application for EchoApp {
        fn name(&self) -> &str {
            "echo"
        }

        fn initialize(&self, _ctx: &EnclaveContext, data: &[u8]) -> Result<(), HandlerError> {
            if data.is_empty() {
                return Err(HandlerError::BadRequest("empty payload".to_string()));
            }
            Ok(())
        }

        fn register_handlers(&self, table: &mut HandlerTable) {
            table
                .route("/finish", |ctx, req| {
                    let bytes = req.data.to_string().into_bytes();
                    ctx.finalize(bytes)?;
                    Ok(Reply::ok(json!({"status": "success"})))
                })
                .route_prefix("/items/", |_, _| Ok(Reply::ok(json!({"matched": "items"}))))
                .route_prefix("/items/special/", |_, _| {
                    Ok(Reply::ok(json!({"matched": "special"})))
                })
                .route("/fail", |_, _| Err(HandlerError::BadRequest("nope".to_string())));
        }
    }

    fn dispatcher() -> Dispatcher {
        let kms: Arc<dyn KmsService> = Arc::new(MockKmsService::generate().unwrap());
        let ctx = Arc::new(EnclaveContext::new(kms, false));
        Dispatcher::new(ctx, Arc::new(EchoApp))
    }

    fn init_request(bytes: &[u8]) -> Envelope {
        Envelope::request("/initialize", json!({ "data": BASE64.encode(bytes) }))
    }

    #[test]
    fn test_status_before_initialize() {
        let d = dispatcher();
        let reply = d.handle_request(Envelope::request("/status", json!({})));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["lifecycle"], "uninitialized");
        assert_eq!(reply.body["computation_status"], "running");
        assert_eq!(reply.body["result"], "");
        assert_eq!(reply.body["signature"], "");
    }

    #[test]
    fn test_initialize_then_conflict() {
        let d = dispatcher();
        let reply = d.handle_request(init_request(b"hello"));
        assert_eq!(reply.status, 200);
        assert_eq!(d.context().lifecycle(), Lifecycle::Initialized);

        let again = d.handle_request(init_request(b"hello"));
        assert_eq!(again.status, 409);
        assert_eq!(again.body["status"], "error");
    }

    #[test]
    fn test_initialize_rejects_bad_input() {
        let d = dispatcher();
        let missing = d.handle_request(Envelope::request("/initialize", json!({})));
        assert_eq!(missing.status, 400);

        let not_base64 = d.handle_request(Envelope::request("/initialize", json!({"data": "!!"})));
        assert_eq!(not_base64.status, 400);

        let app_rejects = d.handle_request(init_request(b""));
        assert_eq!(app_rejects.status, 400);
        assert_eq!(d.context().lifecycle(), Lifecycle::Uninitialized);
    }

    #[test]
    fn test_custom_handler_runs_and_finalizes() {
        let d = dispatcher();
        d.handle_request(init_request(b"x"));

        let reply = d.handle_request(Envelope::request("/items/1", json!({})));
        assert_eq!(reply.body["matched"], "items");
        assert_eq!(d.context().lifecycle(), Lifecycle::Running);

        let reply = d.handle_request(Envelope::request("/finish", json!({"v": 1})));
        assert_eq!(reply.status, 200);
        assert_eq!(d.context().lifecycle(), Lifecycle::Finalized);

        let after = d.handle_request(Envelope::request("/items/2", json!({})));
        assert_eq!(after.status, 409);

        let init_after = d.handle_request(init_request(b"x"));
        assert_eq!(init_after.status, 409);
        assert_eq!(init_after.body["message"], "enclave already finalized");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let d = dispatcher();
        let reply = d.handle_request(Envelope::request("/items/special/7", json!({})));
        assert_eq!(reply.body["matched"], "special");
    }

    #[test]
    fn test_failed_handler_keeps_lifecycle() {
        let d = dispatcher();
        d.handle_request(init_request(b"x"));
        let reply = d.handle_request(Envelope::request("/fail", json!({})));
        assert_eq!(reply.status, 400);
        assert_eq!(d.context().lifecycle(), Lifecycle::Initialized);
    }

    #[test]
    fn test_unknown_endpoint_echoes() {
        let d = dispatcher();
        let reply = d.handle_request(Envelope::request("/whatever", json!({"k": "v"})));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["status"], "success");
        assert_eq!(reply.body["message"], "echo received request at /whatever");
        assert_eq!(reply.body["data"], json!({"k": "v"}));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let d = dispatcher();
        let ctx = d.context();
        assert!(ctx.finalize(b"first".to_vec()).unwrap());
        assert!(!ctx.finalize(b"second".to_vec()).unwrap());

        let stored = ctx.result().unwrap();
        assert_eq!(stored.raw_bytes, b"first");
        assert!(eth::verify(
            &ctx.kms().signing_public_key(),
            b"first",
            &stored.signature
        ));

        let a = d.handle_request(Envelope::request("/status", json!({})));
        let b = d.handle_request(Envelope::request("/settlement", json!({})));
        assert_eq!(a.body["result"], b.body["result"]);
        assert_eq!(a.body["signature"], b.body["signature"]);
        assert_eq!(a.body["computation_status"], "completed");
    }

    #[test]
    fn test_attest_with_nonce() {
        let d = dispatcher();
        let reply = d.handle_request(Envelope::request("/attest", json!({"nonce": "abc123"})));
        assert_eq!(reply.status, 200);

        let encoded = reply.body["attestation"]["attestation_doc"].as_str().unwrap();
        let document = verify_document(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(document.nonce.unwrap().as_slice(), b"abc123");
    }

    #[test]
    fn test_formatted_attest() {
        let d = dispatcher();
        let reply = d.handle_request(Envelope::request("formatted-attest", json!({"nonce": "n"})));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["attestation"]["digest"], "SHA384");
        assert_eq!(reply.body["attestation"]["nonce"], "n");
        assert_eq!(reply.body["attestation"]["pcrs"].as_object().unwrap().len(), 16);
    }

    #[test]
    fn test_attest_rejects_non_string_nonce() {
        let d = dispatcher();
        for nonce in [json!(12345), json!([1, 2, 3]), json!({"n": 1})] {
            let request = Envelope::request("/attest", json!({ "nonce": nonce.clone() }));
            let reply = d.handle_request(request);
            assert_eq!(reply.status, 400, "{}", nonce);
            assert_eq!(reply.body["status"], "error");
        }

        let bad_user_data =
            d.handle_request(Envelope::request("/formatted-attest", json!({"user_data": true})));
        assert_eq!(bad_user_data.status, 400);
    }

    #[test]
    fn test_attest_keeps_empty_nonce() {
        let d = dispatcher();
        let reply = d.handle_request(Envelope::request("/attest", json!({"nonce": ""})));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["attestation"]["nonce"], "");

        let encoded = reply.body["attestation"]["attestation_doc"].as_str().unwrap();
        let document = verify_document(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(document.nonce.map(|n| n.into_vec()), Some(Vec::new()));

        let absent = d.handle_request(Envelope::request("/attest", json!({"nonce": null})));
        assert_eq!(absent.status, 200);
        assert!(absent.body["attestation"]["nonce"].is_null());
    }

    #[test]
    fn test_kms_decrypt_roundtrip() {
        let d = dispatcher();
        let sealed = seal_to(&d.context().identity().public_key, b"secret").unwrap();

        let reply = d.handle_request(Envelope::request(
            "/kms",
            json!({"operation": "decrypt", "encrypted_data": BASE64.encode(sealed)}),
        ));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["operation"], "decrypt");
        assert_eq!(
            BASE64.decode(reply.body["plaintext"].as_str().unwrap()).unwrap(),
            b"secret"
        );

        let garbage = d.handle_request(Envelope::request(
            "/kms",
            json!({"operation": "decrypt", "encrypted_data": BASE64.encode([0u8; 8])}),
        ));
        assert_eq!(garbage.status, 400);
    }

    #[test]
    fn test_kms_generate() {
        let d = dispatcher();
        let random = d.handle_request(Envelope::request(
            "/kms",
            json!({"operation": "genrandom", "length": 48}),
        ));
        assert_eq!(random.status, 200);
        let bytes = BASE64.decode(random.body["random"].as_str().unwrap()).unwrap();
        assert_eq!(bytes.len(), 48);

        let default_len =
            d.handle_request(Envelope::request("/kms", json!({"operation": "genrandom"})));
        assert_eq!(default_len.body["length"], 32);

        let too_long = d.handle_request(Envelope::request(
            "/kms",
            json!({"operation": "genrandom", "length": MAX_RANDOM_BYTES + 1}),
        ));
        assert_eq!(too_long.status, 400);

        let key = d.handle_request(Envelope::request(
            "/kms",
            json!({"operation": "genkey", "key_spec": "AES_128"}),
        ));
        assert_eq!(key.status, 200);
        let private_key = BASE64.decode(key.body["private_key"].as_str().unwrap()).unwrap();
        let sealed = BASE64.decode(key.body["public_key"].as_str().unwrap()).unwrap();
        assert_eq!(private_key.len(), 16);
        assert_eq!(d.context().kms().decrypt(&sealed).unwrap(), private_key);
    }

    #[test]
    fn test_kms_rejects_bad_operations() {
        let d = dispatcher();
        let requests = [
            json!({}),
            json!({"operation": "sign"}),
            json!({"operation": "genkey", "key_spec": "RSA_2048"}),
            json!({"operation": "decrypt"}),
        ];
        for data in requests {
            let reply = d.handle_request(Envelope::request("/kms", data.clone()));
            assert_eq!(reply.status, 400, "{}", data);
        }
    }

    #[test]
    fn test_status_is_consistent_under_concurrent_finalize() {
        let d = Arc::new(dispatcher());
        d.handle_request(init_request(b"x"));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let d = Arc::clone(&d);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let body = d.handle_request(Envelope::request("/status", json!({}))).body;
                        let finalized = body["lifecycle"] == "finalized";
                        let completed = body["computation_status"] == "completed";
                        let has_result = body["result"] != "";
                        assert_eq!(finalized, completed, "{}", body);
                        assert_eq!(completed, has_result, "{}", body);
                    }
                })
            })
            .collect();

        let finalizers: Vec<_> = (0..4u8)
            .map(|i| {
                let ctx = Arc::clone(d.context());
                std::thread::spawn(move || ctx.finalize(vec![i; 4]).unwrap())
            })
            .collect();

        let winners = finalizers
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(winners, 1);
        let stored = d.context().result().unwrap();
        assert!(eth::verify(
            &d.context().kms().signing_public_key(),
            &stored.raw_bytes,
            &stored.signature
        ));
    }

    #[test]
    fn test_health_and_public_key() {
        let d = dispatcher();
        let health = d.handle_request(Envelope::request("/health", json!({})));
        assert_eq!(health.body["status"], "ok");
        assert_eq!(
            health.body["created_at"],
            d.context().identity().created_at.to_rfc3339()
        );

        let key = d.handle_request(Envelope::request("/public-key", json!({})));
        assert!(key.body["public_key_pem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY"));
        assert_eq!(key.body["capabilities"]["nsm_available"], false);
        assert_eq!(
            key.body["public_key"],
            format!(
                "0x{}",
                hex::encode(d.context().kms().signing_public_key().to_encoded_point(false))
            )
        );
        assert_eq!(
            key.body["eth_address"],
            eth::address(&d.context().kms().signing_public_key())
        );
    }
}
