use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::StatusCode;
use podmig_common::{MigrationError, MigrationResult, Pod, PodDirectory, CLONE_SOURCE_LABEL};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::{ClientTlsConfig, NodeConfig};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Pod {pod} has no {label} label", label = CLONE_SOURCE_LABEL)]
    MissingCloneSource { pod: String },
    #[error("Failed to look up source pod {namespace}/{name}: {source}")]
    SourceLookup {
        namespace: String,
        name: String,
        #[source]
        source: MigrationError,
    },
    #[error("Source node does not know pod {0}")]
    RemoteNotFound(String),
    #[error("Source pod {0} is already being migrated")]
    RemoteConflict(String),
    #[error("Source node answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Invalid migration result from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to load TLS material from {path}: {reason}")]
    Tls { path: PathBuf, reason: String },
}

impl TriggerError {
    /// Status reported to whoever asked this node to start the migration.
    pub fn status(&self) -> StatusCode {
        match self {
            TriggerError::MissingCloneSource { .. } => StatusCode::BAD_REQUEST,
            TriggerError::SourceLookup { .. } => StatusCode::NOT_FOUND,
            TriggerError::RemoteConflict(_) => StatusCode::CONFLICT,
            TriggerError::RemoteNotFound(_)
            | TriggerError::Status { .. }
            | TriggerError::Transport { .. }
            | TriggerError::Decode { .. } => StatusCode::BAD_GATEWAY,
            TriggerError::Tls { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TriggerError> for MigrationError {
    fn from(err: TriggerError) -> Self {
        match err {
            e @ TriggerError::MissingCloneSource { .. } => MigrationError::InvalidRequest(e.to_string()),
            TriggerError::SourceLookup { source, .. } => source,
            e @ TriggerError::RemoteNotFound(_) => MigrationError::NotFound(e.to_string()),
            e @ TriggerError::RemoteConflict(_) => MigrationError::Conflict(e.to_string()),
            e @ TriggerError::Tls { .. } => MigrationError::Internal(e.to_string()),
            e => MigrationError::Transport(e.to_string()),
        }
    }
}

/// Asks the node running a pod's clone source to checkpoint it and hand
/// over the checkpoint location.
pub struct MigrationClient {
    http: reqwest::Client,
    pods: Arc<dyn PodDirectory>,
    scheme: String,
    port: u16,
}

impl MigrationClient {
    pub fn new(config: &NodeConfig, pods: Arc<dyn PodDirectory>) -> Result<Self, TriggerError> {
        let builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout);
        let http = apply_tls(builder, &config.tls)?
            .build()
            .map_err(|e| TriggerError::Tls {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            pods,
            scheme: config.remote_scheme.clone(),
            port: config.remote_port,
        })
    }

    fn migrate_url(&self, source: &Pod) -> String {
        let host = if source.host_ip.contains(':') {
            format!("[{}]", source.host_ip)
        } else {
            source.host_ip.clone()
        };
        format!("{}://{}:{}/migrate/{}", self.scheme, host, self.port, source.uid)
    }

    /// Blocks until the source node has checkpointed every container of the
    /// clone source of `pod`, or fails.
    #[instrument(skip(self, pod), fields(pod = %pod.name, namespace = %pod.namespace))]
    pub async fn trigger_pod_migration(&self, pod: &Pod) -> Result<MigrationResult, TriggerError> {
        let source_name = pod
            .clone_source()
            .ok_or_else(|| TriggerError::MissingCloneSource {
                pod: format!("{}/{}", pod.namespace, pod.name),
            })?;
        let source = self
            .pods
            .get_pod(&pod.namespace, source_name)
            .await
            .map_err(|source| TriggerError::SourceLookup {
                namespace: pod.namespace.clone(),
                name: source_name.to_string(),
                source,
            })?;

        let url = self.migrate_url(&source);
        let containers = source.container_names().join(",");
        info!(%url, %containers, "Requesting migration from source node");

        let response = self
            .http
            .get(&url)
            .query(&[("containers", containers.as_str())])
            .send()
            .await
            .map_err(|source| TriggerError::Transport {
                url: url.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(TriggerError::RemoteNotFound(source.uid)),
            StatusCode::CONFLICT => return Err(TriggerError::RemoteConflict(source.uid)),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                warn!(%status, %body, "Source node rejected migration");
                return Err(TriggerError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let result = response
            .json::<MigrationResult>()
            .await
            .map_err(|source| TriggerError::Decode { url, source })?;
        info!(path = %result.path, containers = result.containers.len(), "Migration result received");
        Ok(result)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TriggerError> {
    std::fs::read(path).map_err(|e| TriggerError::Tls {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &ClientTlsConfig,
) -> Result<reqwest::ClientBuilder, TriggerError> {
    if let Some(ca) = &tls.ca_cert {
        let cert = reqwest::Certificate::from_pem(&read_pem(ca)?).map_err(|e| TriggerError::Tls {
            path: ca.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        // rustls wants certificate chain and key in one PEM buffer
        let mut pem = read_pem(cert)?;
        pem.push(b'\n');
        pem.extend(read_pem(key)?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| TriggerError::Tls {
            path: cert.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.identity(identity);
    }
    if tls.insecure_skip_tls_verify {
        warn!("TLS verification of peer nodes is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder)
}
