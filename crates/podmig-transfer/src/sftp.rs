use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};
use tracing::{debug, info, warn};

use crate::remote::{EntryKind, RemoteEntry, RemoteFs};
use crate::{Result, TransferError};

const DIR_MODE: i32 = 0o755;

/// Password-authenticated SSH endpoint of a peer node.
#[derive(Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// OpenSSH known_hosts file; defaults to `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
    /// Development only: accept any host key.
    pub insecure_skip_host_key_verification: bool,
    pub connect_timeout: Duration,
}

impl SshConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            password: password.into(),
            known_hosts: None,
            insecure_skip_host_key_verification: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts.clone().or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts"))
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("known_hosts", &self.known_hosts)
            .field(
                "insecure_skip_host_key_verification",
                &self.insecure_skip_host_key_verification,
            )
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

struct SftpInner {
    session: Session,
    sftp: Sftp,
    host: String,
}

/// SFTP session to a peer node. libssh2 is blocking, so every operation runs
/// on the blocking pool; the session is shared by all concurrent transfers.
#[derive(Clone)]
pub struct SftpSession {
    inner: Arc<SftpInner>,
}

impl SftpSession {
    pub async fn connect(config: &SshConfig) -> Result<Self> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&config)).await?
    }

    fn connect_blocking(config: &SshConfig) -> Result<Self> {
        let addr = config.addr();
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|source| TransferError::Connect {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TransferError::Connect {
                addr: addr.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ),
            })?;
        let tcp = TcpStream::connect_timeout(&socket_addr, config.connect_timeout).map_err(
            |source| TransferError::Connect {
                addr: addr.clone(),
                source,
            },
        )?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(config.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake()?;
        verify_host_key(&session, config)?;

        session
            .userauth_password(&config.username, &config.password)
            .map_err(|e| {
                debug!(error = %e, "Password authentication rejected");
                TransferError::Auth {
                    user: config.username.clone(),
                    host: config.host.clone(),
                }
            })?;
        if !session.authenticated() {
            return Err(TransferError::Auth {
                user: config.username.clone(),
                host: config.host.clone(),
            });
        }
        // transfers of large page images must not hit the handshake timeout
        session.set_timeout(0);

        let sftp = session.sftp()?;
        info!(host = %config.host, port = config.port, user = %config.username, "SFTP session established");
        Ok(Self {
            inner: Arc::new(SftpInner {
                session,
                sftp,
                host: config.host.clone(),
            }),
        })
    }

    pub async fn disconnect(&self) {
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            inner
                .session
                .disconnect(None, "transfer complete", None)
                .map(|_| inner.host.clone())
        })
        .await;
        match result {
            Ok(Ok(host)) => debug!(%host, "SFTP session closed"),
            Ok(Err(e)) => warn!(error = %e, "Failed to close SSH session cleanly"),
            Err(e) => warn!(error = %e, "SSH disconnect task failed"),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SftpInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner)).await?
    }
}

fn verify_host_key(session: &Session, config: &SshConfig) -> Result<()> {
    if config.insecure_skip_host_key_verification {
        warn!(host = %config.host, "Host key verification disabled");
        return Ok(());
    }
    let host_key_err = |reason: String| TransferError::HostKey {
        host: config.host.clone(),
        reason,
    };

    let path = config
        .known_hosts_path()
        .ok_or_else(|| host_key_err("no known_hosts file configured".to_string()))?;
    let mut known_hosts = session.known_hosts()?;
    known_hosts
        .read_file(&path, KnownHostFileKind::OpenSSH)
        .map_err(|e| host_key_err(format!("cannot read {}: {}", path.display(), e)))?;
    let (key, _) = session
        .host_key()
        .ok_or_else(|| host_key_err("server presented no host key".to_string()))?;

    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(host_key_err("host key does not match known_hosts".to_string())),
        CheckResult::NotFound => Err(host_key_err(format!("host not listed in {}", path.display()))),
        CheckResult::Failure => Err(host_key_err("known_hosts check failed".to_string())),
    }
}

fn entry_kind(stat: &ssh2::FileStat) -> EntryKind {
    let file_type = stat.file_type();
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn kind(&self, path: &Path) -> Result<EntryKind> {
        let path = path.to_path_buf();
        self.blocking(move |inner| {
            let stat = inner
                .sftp
                .lstat(&path)
                .map_err(|e| TransferError::sftp("lstat", &path, e))?;
            Ok(entry_kind(&stat))
        })
        .await
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<RemoteEntry>> {
        let path = path.to_path_buf();
        self.blocking(move |inner| {
            // readdir joins names onto `path` and drops `.` and `..`
            let listing = inner
                .sftp
                .readdir(&path)
                .map_err(|e| TransferError::sftp("read dir", &path, e))?;
            Ok(listing
                .into_iter()
                .filter_map(|(full, stat)| {
                    full.file_name().map(|name| RemoteEntry {
                        name: name.to_os_string(),
                        kind: entry_kind(&stat),
                    })
                })
                .collect())
        })
        .await
    }

    async fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let path = path.to_path_buf();
        self.blocking(move |inner| {
            inner
                .sftp
                .readlink(&path)
                .map_err(|e| TransferError::sftp("read link", &path, e))
        })
        .await
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let target = target.to_path_buf();
        let link = link.to_path_buf();
        self.blocking(move |inner| {
            if let Ok(existing) = inner.sftp.lstat(&link) {
                if !existing.is_dir() {
                    inner
                        .sftp
                        .unlink(&link)
                        .map_err(|e| TransferError::sftp("replace", &link, e))?;
                }
            }
            // ssh2 takes the link target first, then the path of the new link
            inner
                .sftp
                .symlink(&target, &link)
                .map_err(|e| TransferError::sftp("symlink", &link, e))
        })
        .await
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.blocking(move |inner| {
            let mut missing = Vec::new();
            let mut cursor = Some(path.as_path());
            while let Some(dir) = cursor {
                if dir.as_os_str().is_empty() || inner.sftp.stat(dir).is_ok() {
                    break;
                }
                missing.push(dir.to_path_buf());
                cursor = dir.parent();
            }
            for dir in missing.iter().rev() {
                if let Err(e) = inner.sftp.mkdir(dir, DIR_MODE) {
                    // another task may have created it concurrently
                    if inner.sftp.stat(dir).map(|s| s.is_dir()).unwrap_or(false) {
                        continue;
                    }
                    return Err(TransferError::sftp("create dir", dir, e));
                }
            }
            Ok(())
        })
        .await
    }

    async fn download_file(&self, remote: &Path, local: &Path) -> Result<u64> {
        let remote = remote.to_path_buf();
        let local = local.to_path_buf();
        self.blocking(move |inner| {
            let mut source = inner
                .sftp
                .open(&remote)
                .map_err(|e| TransferError::sftp("open", &remote, e))?;
            let mut dest = std::fs::File::create(&local)
                .map_err(|e| TransferError::io("create", &local, e))?;
            let bytes = std::io::copy(&mut source, &mut dest)
                .map_err(|e| TransferError::io("copy", &remote, e))?;
            dest.sync_all()
                .map_err(|e| TransferError::io("sync", &local, e))?;
            Ok(bytes)
        })
        .await
    }

    async fn upload_file(&self, local: &Path, remote: &Path) -> Result<u64> {
        let local = local.to_path_buf();
        let remote = remote.to_path_buf();
        self.blocking(move |inner| {
            let mut source = std::fs::File::open(&local)
                .map_err(|e| TransferError::io("open", &local, e))?;
            let mut dest = inner
                .sftp
                .create(&remote)
                .map_err(|e| TransferError::sftp("create", &remote, e))?;
            std::io::copy(&mut source, &mut dest)
                .map_err(|e| TransferError::io("copy", &local, e))
        })
        .await
    }
}
