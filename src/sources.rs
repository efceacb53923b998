//! How a scan worker reaches an endpoint's files: by mounting its
//! administrative share, or by asking its agent through the relay.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};
use tokio::runtime::Handle;

use crate::agent::commands::list_directory;
use crate::config::{Credential, ScanConfig};
use crate::endpoints::Endpoint;
use crate::error::DocSweepError;
use crate::relay::client::RelayClient;
use crate::relay::protocol::{AgentCommand, CommandStatus, DownloadedFile, RemoteFileEntry};

/// Profile directories that are not real users
const SKIPPED_PROFILES: [&str; 3] = ["Default", "Default User", "All Users"];

/// An open view onto one endpoint's filesystem
pub trait SourceSession: Send {
    /// Directory holding the user profiles
    fn users_root(&self) -> String;

    fn child(&self, parent: &str, name: &str) -> String;

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteFileEntry>, DocSweepError>;

    /// Local readable copy or view of `entry`; `None` when it cannot be read
    fn materialize(&mut self, entry: &RemoteFileEntry) -> Result<Option<PathBuf>, DocSweepError>;

    fn release(&mut self) -> Result<(), DocSweepError>;
}

pub trait EndpointSource: Send + Sync {
    fn open(&self, endpoint: &Endpoint) -> Result<OpenedSession, DocSweepError>;
}

/// A session that is released when dropped, whatever path the scan took
pub struct OpenedSession {
    hostname: String,
    session: Box<dyn SourceSession>,
    credential_attempts: u32,
    released: bool,
}

impl OpenedSession {
    pub fn new(hostname: &str, session: Box<dyn SourceSession>, credential_attempts: u32) -> Self {
        OpenedSession {
            hostname: hostname.to_string(),
            session,
            credential_attempts,
            released: false,
        }
    }

    pub fn credential_attempts(&self) -> u32 {
        self.credential_attempts
    }

    pub fn session(&mut self) -> &mut dyn SourceSession {
        self.session.as_mut()
    }

    /// `.pdf` files under the given folders of every user profile, at most
    /// `max_depth` directory levels below each folder
    pub fn candidates(
        &mut self,
        user_folders: &[String],
        max_depth: usize,
    ) -> Result<Vec<RemoteFileEntry>, DocSweepError> {
        let root = self.session.users_root();
        let profiles = self.session.list_dir(&root)?;

        let mut found = Vec::new();
        for profile in profiles.iter().filter(|p| p.is_dir) {
            if SKIPPED_PROFILES.iter().any(|s| s.eq_ignore_ascii_case(&profile.name)) {
                continue;
            }
            for folder in user_folders {
                let start = self.session.child(&profile.path, folder);
                self.walk(&start, 0, max_depth, &mut found)?;
            }
        }
        Ok(found)
    }

    fn walk(
        &mut self,
        dir: &str,
        depth: usize,
        max_depth: usize,
        found: &mut Vec<RemoteFileEntry>,
    ) -> Result<(), DocSweepError> {
        let entries = match self.session.list_dir(dir) {
            Ok(entries) => entries,
            Err(e @ DocSweepError::Connectivity(_)) => return Err(e),
            Err(e) => {
                debug!("[SCAN] {}: skipping {}: {}", self.hostname, dir, e);
                return Ok(());
            }
        };

        for entry in entries {
            if entry.is_dir {
                if depth < max_depth {
                    self.walk(&entry.path, depth + 1, max_depth, found)?;
                }
            } else if entry.name.to_ascii_lowercase().ends_with(".pdf") {
                found.push(entry);
            }
        }
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), DocSweepError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.session.release()
    }
}

impl Drop for OpenedSession {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("[SCAN] {}: release failed: {}", self.hostname, e);
        }
    }
}

//
// Administrative share
//

pub trait Mounter: Send + Sync {
    /// Mount `unc` and return the local directory that exposes it
    fn mount(&self, unc: &str, mount_point: &Path, credential: &Credential) -> Result<PathBuf, DocSweepError>;
    fn unmount(&self, root: &Path) -> Result<(), DocSweepError>;
}

fn run_checked(command: &mut Command, what: &str) -> Result<(), DocSweepError> {
    let output = command.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(DocSweepError::Error(format!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// `net use` on Windows controllers; the UNC path is usable directly
pub struct NetUseMounter;

impl Mounter for NetUseMounter {
    fn mount(&self, unc: &str, _mount_point: &Path, credential: &Credential) -> Result<PathBuf, DocSweepError> {
        run_checked(
            Command::new("net").args([
                "use",
                unc,
                &credential.password,
                &format!("/user:{}", credential.username),
                "/persistent:no",
            ]),
            "net use",
        )?;
        Ok(PathBuf::from(unc))
    }

    fn unmount(&self, root: &Path) -> Result<(), DocSweepError> {
        run_checked(
            Command::new("net").args(["use", &root.to_string_lossy(), "/delete", "/y"]),
            "net use /delete",
        )
    }
}

/// Read-only CIFS mount on Unix controllers
pub struct CifsMounter;

impl Mounter for CifsMounter {
    fn mount(&self, unc: &str, mount_point: &Path, credential: &Credential) -> Result<PathBuf, DocSweepError> {
        fs::create_dir_all(mount_point)?;
        let share = unc.replace('\\', "/");
        run_checked(
            Command::new("mount").args([
                "-t",
                "cifs",
                &share,
                &mount_point.to_string_lossy(),
                "-o",
                &format!("ro,username={},password={}", credential.username, credential.password),
            ]),
            "mount -t cifs",
        )?;
        Ok(mount_point.to_path_buf())
    }

    fn unmount(&self, root: &Path) -> Result<(), DocSweepError> {
        run_checked(Command::new("umount").arg(root), "umount")
    }
}

pub fn platform_mounter() -> Arc<dyn Mounter> {
    if cfg!(windows) {
        Arc::new(NetUseMounter)
    } else {
        Arc::new(CifsMounter)
    }
}

pub struct ShareSource {
    share_name: String,
    mount_root: PathBuf,
    admin: Option<Credential>,
    credentials: Vec<(String, Credential)>,
    mounter: Arc<dyn Mounter>,
}

impl ShareSource {
    pub fn new(config: &ScanConfig, mounter: Arc<dyn Mounter>) -> Self {
        ShareSource {
            share_name: config.share_name.clone(),
            mount_root: config.mount_root.clone(),
            admin: config.admin.clone(),
            credentials: config
                .credentials
                .iter()
                .map(|(host, cred)| (host.clone(), cred.clone()))
                .collect(),
            mounter,
        }
    }

    fn endpoint_credential(&self, endpoint: &Endpoint) -> Option<&Credential> {
        self.credentials
            .iter()
            .find(|(host, _)| {
                host.eq_ignore_ascii_case(&endpoint.hostname) || host.eq_ignore_ascii_case(&endpoint.address)
            })
            .map(|(_, cred)| cred)
    }
}

impl EndpointSource for ShareSource {
    fn open(&self, endpoint: &Endpoint) -> Result<OpenedSession, DocSweepError> {
        let unc = format!("\\\\{}\\{}", endpoint.address, self.share_name);
        let mount_point = self.mount_root.join(&endpoint.hostname);

        let attempts = [
            ("endpoint", self.endpoint_credential(endpoint)),
            ("administrative", self.admin.as_ref()),
        ];

        let mut tried = 0;
        let mut failures = Vec::new();
        for (label, credential) in attempts {
            let credential = match credential {
                Some(credential) => credential,
                None => {
                    debug!("[SCAN] {}: no {} credentials configured", endpoint.hostname, label);
                    continue;
                }
            };

            tried += 1;
            info!(
                "[SCAN] {}: mounting {} with {} credentials ({})",
                endpoint.hostname, unc, label, credential.username
            );
            match self.mounter.mount(&unc, &mount_point, credential) {
                Ok(root) => {
                    let session = ShareSession {
                        root,
                        mounter: Arc::clone(&self.mounter),
                    };
                    return Ok(OpenedSession::new(&endpoint.hostname, Box::new(session), tried));
                }
                Err(e) => {
                    warn!(
                        "[SCAN] {}: mount with {} credentials failed: {}",
                        endpoint.hostname, label, e
                    );
                    failures.push(format!("{}: {}", label, e));
                }
            }
        }

        if tried == 0 {
            return Err(DocSweepError::endpoint(
                &endpoint.hostname,
                "no credentials configured for the share",
            ));
        }
        Err(DocSweepError::endpoint(
            &endpoint.hostname,
            format!("could not mount {} ({})", unc, failures.join("; ")),
        ))
    }
}

struct ShareSession {
    root: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl SourceSession for ShareSession {
    fn users_root(&self) -> String {
        self.root.join("Users").to_string_lossy().into_owned()
    }

    fn child(&self, parent: &str, name: &str) -> String {
        Path::new(parent).join(name).to_string_lossy().into_owned()
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteFileEntry>, DocSweepError> {
        list_directory(Path::new(path))
    }

    fn materialize(&mut self, entry: &RemoteFileEntry) -> Result<Option<PathBuf>, DocSweepError> {
        let path = PathBuf::from(&entry.path);
        match File::open(&path) {
            Ok(_) => Ok(Some(path)),
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn release(&mut self) -> Result<(), DocSweepError> {
        self.mounter.unmount(&self.root)
    }
}

//
// Relay
//

/// Reads endpoint files through the agent, staging downloads locally
pub struct RelaySource {
    client: RelayClient,
    runtime: Handle,
    staging_root: PathBuf,
}

impl RelaySource {
    pub fn new(client: RelayClient, runtime: Handle, staging_root: PathBuf) -> Self {
        RelaySource {
            client,
            runtime,
            staging_root,
        }
    }
}

impl EndpointSource for RelaySource {
    fn open(&self, endpoint: &Endpoint) -> Result<OpenedSession, DocSweepError> {
        if !self.client.is_connected() {
            return Err(DocSweepError::endpoint(&endpoint.hostname, "controller is not connected to the hub"));
        }

        let staging = self
            .staging_root
            .join(format!("{}-{}", endpoint.hostname, uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)?;

        let session = RelaySession {
            client: self.client.clone(),
            runtime: self.runtime.clone(),
            hostname: endpoint.hostname.clone(),
            staging,
            next_file: 0,
        };
        Ok(OpenedSession::new(&endpoint.hostname, Box::new(session), 0))
    }
}

struct RelaySession {
    client: RelayClient,
    runtime: Handle,
    hostname: String,
    staging: PathBuf,
    next_file: u64,
}

impl RelaySession {
    fn run(&self, command: AgentCommand) -> Result<serde_json::Value, DocSweepError> {
        let result = self
            .runtime
            .block_on(self.client.send_command(&self.hostname, command))?;
        match result.status {
            CommandStatus::Completed => Ok(result.data),
            _ => Err(DocSweepError::Error(
                result.error_message().unwrap_or("command failed").to_string(),
            )),
        }
    }
}

impl SourceSession for RelaySession {
    fn users_root(&self) -> String {
        "C:\\Users".to_string()
    }

    fn child(&self, parent: &str, name: &str) -> String {
        format!("{}\\{}", parent.trim_end_matches('\\'), name)
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteFileEntry>, DocSweepError> {
        let data = self.run(AgentCommand::ListFiles {
            path: path.to_string(),
        })?;
        Ok(serde_json::from_value(data)?)
    }

    fn materialize(&mut self, entry: &RemoteFileEntry) -> Result<Option<PathBuf>, DocSweepError> {
        let data = match self.run(AgentCommand::DownloadFile {
            remote_path: entry.path.clone(),
        }) {
            Ok(data) => data,
            Err(e @ DocSweepError::Connectivity(_)) => return Err(e),
            Err(e) => {
                debug!("[SCAN] {}: cannot download {}: {}", self.hostname, entry.path, e);
                return Ok(None);
            }
        };

        let file: DownloadedFile = serde_json::from_value(data)?;
        let bytes = BASE64
            .decode(file.file_content)
            .map_err(|e| DocSweepError::Error(format!("bad download payload: {}", e)))?;

        // keep the original name so kind inference still sees it
        self.next_file += 1;
        let dir = self.staging.join(self.next_file.to_string());
        fs::create_dir_all(&dir)?;
        let local = dir.join(&entry.name);
        fs::write(&local, bytes)?;
        Ok(Some(local))
    }

    fn release(&mut self) -> Result<(), DocSweepError> {
        match fs::remove_dir_all(&self.staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
