//! Runtime configuration
//!
//! Both binaries read their settings from the environment at startup.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ENV_SETUP` | `SIM` (TCP/HTTP, mock KMS) or `NITRO` (vsock, NSM) | `SIM` |
//! | `VSOCK_PORT` | vsock port the enclave listens on | `5000` |
//! | `ENCLAVE_PORT` | HTTP or framed-TCP port of the simulated enclave | `5000` |
//! | `ENCLAVE_HOST` | host of the simulated enclave, as seen by the parent | `enclave` |
//! | `ENCLAVE_CID` | vsock CID of the enclave, as seen by the parent | `16` |
//! | `PARENT_PORT` | HTTP port of the parent proxy | `8001` |
//! | `USE_RAW_SOCKET` | serve framed TCP instead of HTTP in simulation | unset |
//! | `READ_TIMEOUT_SECS` | per-read and per-request timeout | `5` |
//! | `MAX_FRAME_BYTES` | largest frame a transport accepts | `16777216` |
//! | `DEBUG` | debug flag reported by `/status` | `false` |
//! | `MOCK_KEYS_DIR` | directory holding `enclave_app_key.pem` / `enclave_key.pem` | unset |
//! | `MOCK_SEED` | 32-byte hex seed for the mock key and measurements | unset |
//! | `INIT_DATA` | hex payload the parent sends to `/initialize` | unset |
//! | `LOG_FORMAT` | `json` or `pretty` | `pretty` |
//! | `RUST_LOG` | log level filter | `info` |

use crate::error::EnclaveError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SETUP_ENV: &str = "ENV_SETUP";
pub const VSOCK_PORT_ENV: &str = "VSOCK_PORT";
pub const ENCLAVE_PORT_ENV: &str = "ENCLAVE_PORT";
pub const ENCLAVE_HOST_ENV: &str = "ENCLAVE_HOST";
pub const ENCLAVE_CID_ENV: &str = "ENCLAVE_CID";
pub const PARENT_PORT_ENV: &str = "PARENT_PORT";
pub const USE_RAW_SOCKET_ENV: &str = "USE_RAW_SOCKET";
pub const READ_TIMEOUT_SECS_ENV: &str = "READ_TIMEOUT_SECS";
pub const MAX_FRAME_BYTES_ENV: &str = "MAX_FRAME_BYTES";
pub const DEBUG_ENV: &str = "DEBUG";
pub const MOCK_KEYS_DIR_ENV: &str = "MOCK_KEYS_DIR";
pub const MOCK_SEED_ENV: &str = "MOCK_SEED";
pub const INIT_DATA_ENV: &str = "INIT_DATA";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_VSOCK_PORT: u32 = 5000;
pub const DEFAULT_ENCLAVE_PORT: u16 = 5000;
pub const DEFAULT_ENCLAVE_HOST: &str = "enclave";
/// First CID handed out to enclaves by the Nitro CLI
pub const DEFAULT_ENCLAVE_CID: u32 = 16;
pub const DEFAULT_PARENT_PORT: u16 = 8001;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Deployment mode, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvSetup {
    /// Plain TCP/HTTP with the emulated KMS
    #[default]
    Sim,
    /// vsock with the Nitro Secure Module
    Nitro,
}

impl EnvSetup {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvSetup::Sim => "SIM",
            EnvSetup::Nitro => "NITRO",
        }
    }
}

impl FromStr for EnvSetup {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIM" | "SIMULATION" => Ok(EnvSetup::Sim),
            "NITRO" => Ok(EnvSetup::Nitro),
            other => Err(EnclaveError::Config(format!(
                "{} must be SIM or NITRO, got {:?}",
                ENV_SETUP_ENV, other
            ))),
        }
    }
}

impl std::fmt::Display for EnvSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects and parameterizes the KMS backend
#[derive(Debug, Clone, Default)]
pub struct KmsConfig {
    pub env_setup: EnvSetup,
    pub mock_keys_dir: Option<PathBuf>,
    pub mock_seed: Option<[u8; 32]>,
}

/// Settings of the enclave server
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    pub env_setup: EnvSetup,
    pub vsock_port: u32,
    pub enclave_port: u16,
    pub use_raw_socket: bool,
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
    pub debug: bool,
    pub kms: KmsConfig,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            env_setup: EnvSetup::Sim,
            vsock_port: DEFAULT_VSOCK_PORT,
            enclave_port: DEFAULT_ENCLAVE_PORT,
            use_raw_socket: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
            kms: KmsConfig::default(),
        }
    }
}

impl EnclaveConfig {
    pub fn from_env() -> Result<Self, EnclaveError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnclaveError> {
        let env = Lookup(&lookup);
        let env_setup = env.parse_or(ENV_SETUP_ENV, EnvSetup::Sim)?;

        Ok(Self {
            env_setup,
            vsock_port: env.parse_or(VSOCK_PORT_ENV, DEFAULT_VSOCK_PORT)?,
            enclave_port: env.parse_or(ENCLAVE_PORT_ENV, DEFAULT_ENCLAVE_PORT)?,
            use_raw_socket: env.flag(USE_RAW_SOCKET_ENV),
            read_timeout: Duration::from_secs(
                env.parse_or(READ_TIMEOUT_SECS_ENV, DEFAULT_READ_TIMEOUT.as_secs())?,
            ),
            max_frame_bytes: env.parse_or(MAX_FRAME_BYTES_ENV, DEFAULT_MAX_FRAME_BYTES)?,
            debug: env.flag(DEBUG_ENV),
            kms: KmsConfig {
                env_setup,
                mock_keys_dir: env.get(MOCK_KEYS_DIR_ENV).map(PathBuf::from),
                mock_seed: env
                    .get(MOCK_SEED_ENV)
                    .map(|seed| parse_seed(&seed))
                    .transpose()?,
            },
        })
    }
}

/// Settings of the parent proxy
#[derive(Debug, Clone)]
pub struct ParentConfig {
    pub env_setup: EnvSetup,
    pub enclave_host: String,
    pub enclave_port: u16,
    pub enclave_cid: u32,
    pub vsock_port: u32,
    pub parent_port: u16,
    pub use_raw_socket: bool,
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
    pub init_data: Option<Vec<u8>>,
}

impl ParentConfig {
    pub fn from_env() -> Result<Self, EnclaveError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnclaveError> {
        let env = Lookup(&lookup);

        Ok(Self {
            env_setup: env.parse_or(ENV_SETUP_ENV, EnvSetup::Sim)?,
            enclave_host: env
                .get(ENCLAVE_HOST_ENV)
                .unwrap_or_else(|| DEFAULT_ENCLAVE_HOST.to_string()),
            enclave_port: env.parse_or(ENCLAVE_PORT_ENV, DEFAULT_ENCLAVE_PORT)?,
            enclave_cid: env.parse_or(ENCLAVE_CID_ENV, DEFAULT_ENCLAVE_CID)?,
            vsock_port: env.parse_or(VSOCK_PORT_ENV, DEFAULT_VSOCK_PORT)?,
            parent_port: env.parse_or(PARENT_PORT_ENV, DEFAULT_PARENT_PORT)?,
            use_raw_socket: env.flag(USE_RAW_SOCKET_ENV),
            request_timeout: Duration::from_secs(
                env.parse_or(READ_TIMEOUT_SECS_ENV, DEFAULT_READ_TIMEOUT.as_secs())?,
            ),
            max_frame_bytes: env.parse_or(MAX_FRAME_BYTES_ENV, DEFAULT_MAX_FRAME_BYTES)?,
            init_data: env
                .get(INIT_DATA_ENV)
                .map(|data| parse_hex(INIT_DATA_ENV, &data))
                .transpose()?,
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    /// Unset and blank variables are treated alike
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
        })
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, EnclaveError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| EnclaveError::Config(format!("invalid {}={:?}: {}", key, raw, e))),
            None => Ok(default),
        }
    }
}

/// Decodes hex with an optional `0x` prefix
pub fn parse_hex(name: &str, value: &str) -> Result<Vec<u8>, EnclaveError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(digits).map_err(|e| EnclaveError::Config(format!("{} is not valid hex: {}", name, e)))
}

fn parse_seed(value: &str) -> Result<[u8; 32], EnclaveError> {
    let bytes = parse_hex(MOCK_SEED_ENV, value)?;
    bytes.as_slice().try_into().map_err(|_| {
        EnclaveError::Config(format!(
            "{} must be 32 bytes, got {}",
            MOCK_SEED_ENV,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_enclave_defaults() {
        let config = EnclaveConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.env_setup, EnvSetup::Sim);
        assert_eq!(config.vsock_port, 5000);
        assert_eq!(config.enclave_port, 5000);
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert!(!config.use_raw_socket);
        assert!(!config.debug);
        assert!(config.kms.mock_seed.is_none());
    }

    #[test]
    fn test_enclave_overrides() {
        let seed = "ab".repeat(32);
        let config = EnclaveConfig::from_lookup(lookup(&[
            ("ENV_SETUP", "nitro"),
            ("VSOCK_PORT", "7000"),
            ("USE_RAW_SOCKET", "1"),
            ("DEBUG", "true"),
            ("MOCK_SEED", seed.as_str()),
            ("MOCK_KEYS_DIR", "/keys"),
        ]))
        .unwrap();
        assert_eq!(config.env_setup, EnvSetup::Nitro);
        assert_eq!(config.kms.env_setup, EnvSetup::Nitro);
        assert_eq!(config.vsock_port, 7000);
        assert!(config.use_raw_socket);
        assert!(config.debug);
        assert_eq!(config.kms.mock_seed, Some([0xab; 32]));
        assert_eq!(config.kms.mock_keys_dir, Some(PathBuf::from("/keys")));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        assert!(EnclaveConfig::from_lookup(lookup(&[("ENV_SETUP", "cloud")])).is_err());
        assert!(EnclaveConfig::from_lookup(lookup(&[("VSOCK_PORT", "abc")])).is_err());
        assert!(EnclaveConfig::from_lookup(lookup(&[("MOCK_SEED", "abcd")])).is_err());
    }

    #[test]
    fn test_false_flag_values() {
        let config = EnclaveConfig::from_lookup(lookup(&[("DEBUG", "false"), ("USE_RAW_SOCKET", "0")]))
            .unwrap();
        assert!(!config.debug);
        assert!(!config.use_raw_socket);
    }

    #[test]
    fn test_parent_init_data_hex() {
        let config = ParentConfig::from_lookup(lookup(&[("INIT_DATA", "0x00ff")])).unwrap();
        assert_eq!(config.init_data, Some(vec![0x00, 0xff]));
        assert_eq!(config.enclave_host, "enclave");
        assert_eq!(config.enclave_cid, 16);
        assert_eq!(config.parent_port, 8001);

        let bare = ParentConfig::from_lookup(lookup(&[("INIT_DATA", "1e")])).unwrap();
        assert_eq!(bare.init_data, Some(vec![0x1e]));

        assert!(ParentConfig::from_lookup(lookup(&[("INIT_DATA", "xyz")])).is_err());
    }
}
