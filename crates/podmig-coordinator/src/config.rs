use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use podmig_checkpoint::runc::CONTAINERD_RUNC_ROOT;
use podmig_common::MigrationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl From<ConfigError> for MigrationError {
    fn from(err: ConfigError) -> Self {
        MigrationError::InvalidRequest(err.to_string())
    }
}

/// TLS material for calls to peer nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// PEM bundle of CAs trusted in addition to the system roots
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Development only: accept any server certificate.
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub root_dir: PathBuf,
    pub remote_scheme: String,
    pub remote_port: u16,
    pub ready_timeout: Duration,
    pub release_timeout: Duration,
    pub request_timeout: Duration,
    pub max_pre_dump_iterations: usize,
    /// Leave source containers running after a completed migration
    pub keep_running: bool,
    pub runc_binary: PathBuf,
    pub runc_root: PathBuf,
    pub tls: ClientTlsConfig,
    /// JSON list of the pods this node serves
    pub pods_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10250)),
            root_dir: PathBuf::from("/var/lib/kubelet"),
            remote_scheme: "https".to_string(),
            remote_port: 10250,
            ready_timeout: Duration::from_secs(600),
            release_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(900),
            max_pre_dump_iterations: 8,
            keep_running: false,
            runc_binary: PathBuf::from("runc"),
            runc_root: PathBuf::from(CONTAINERD_RUNC_ROOT),
            tls: ClientTlsConfig::default(),
            pods_file: None,
        }
    }
}

impl NodeConfig {
    /// Checkpoints are written to `<root_dir>/migration/<pod uid>`.
    pub fn migration_root(&self) -> PathBuf {
        self.root_dir.join("migration")
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `PODMIG_*` variables resolved through `lookup`,
    /// falling back to the defaults for anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path = |key: &str| get(key).map(PathBuf::from);

        let config = Self {
            listen_addr: parse(&get, "PODMIG_LISTEN_ADDR", defaults.listen_addr)?,
            root_dir: path("PODMIG_ROOT_DIR").unwrap_or(defaults.root_dir),
            remote_scheme: match get("PODMIG_REMOTE_SCHEME") {
                Some(s) if s == "http" || s == "https" => s,
                Some(s) => {
                    return Err(ConfigError::Invalid {
                        key: "PODMIG_REMOTE_SCHEME",
                        value: s,
                        reason: "expected http or https".to_string(),
                    })
                }
                None => defaults.remote_scheme,
            },
            remote_port: parse(&get, "PODMIG_REMOTE_PORT", defaults.remote_port)?,
            ready_timeout: secs(&get, "PODMIG_READY_TIMEOUT_SECS", defaults.ready_timeout)?,
            release_timeout: secs(&get, "PODMIG_RELEASE_TIMEOUT_SECS", defaults.release_timeout)?,
            request_timeout: secs(&get, "PODMIG_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            max_pre_dump_iterations: parse(
                &get,
                "PODMIG_MAX_PRE_DUMP_ITERATIONS",
                defaults.max_pre_dump_iterations,
            )?,
            keep_running: flag(&get, "PODMIG_KEEP_RUNNING", defaults.keep_running)?,
            runc_binary: path("PODMIG_RUNC_BINARY").unwrap_or(defaults.runc_binary),
            runc_root: path("PODMIG_RUNC_ROOT").unwrap_or(defaults.runc_root),
            tls: ClientTlsConfig {
                ca_cert: path("PODMIG_TLS_CA_CERT"),
                client_cert: path("PODMIG_TLS_CLIENT_CERT"),
                client_key: path("PODMIG_TLS_CLIENT_KEY"),
                insecure_skip_tls_verify: flag(&get, "PODMIG_INSECURE_SKIP_TLS_VERIFY", false)?,
            },
            pods_file: path("PODMIG_PODS_FILE"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pre_dump_iterations == 0 {
            return Err(ConfigError::Zero("PODMIG_MAX_PRE_DUMP_ITERATIONS"));
        }
        if self.ready_timeout.is_zero() {
            return Err(ConfigError::Zero("PODMIG_READY_TIMEOUT_SECS"));
        }
        if self.release_timeout.is_zero() {
            return Err(ConfigError::Zero("PODMIG_RELEASE_TIMEOUT_SECS"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("PODMIG_REQUEST_TIMEOUT_SECS"));
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return Err(ConfigError::Invalid {
                key: "PODMIG_TLS_CLIENT_CERT",
                value: format!("{:?}", self.tls.client_cert),
                reason: "client certificate and key must be set together".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            })
        }
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default.as_secs()).map(Duration::from_secs)
}

fn flag<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
        None => Ok(default),
    }
}
