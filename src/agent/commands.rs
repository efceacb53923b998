use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde_json::Value;

use crate::error::DocSweepError;
use crate::relay::protocol::{
    AgentCommand, CommandFrame, CommandResultFrame, DownloadedFile, RemoteFileEntry,
};

/// Executes filesystem commands on the agent's host
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    max_download_bytes: u64,
}

impl CommandExecutor {
    pub fn new(max_download_bytes: u64) -> Self {
        CommandExecutor { max_download_bytes }
    }

    /// Blocking; callers run it off the async runtime
    pub fn execute(&self, command: &AgentCommand) -> Result<Value, DocSweepError> {
        match command {
            AgentCommand::ListFiles { path } => Self::list_files(Path::new(path)),
            AgentCommand::DownloadFile { remote_path } => self.download_file(Path::new(remote_path)),
            AgentCommand::UploadFile {
                remote_path,
                file_content,
            } => Self::upload_file(Path::new(remote_path), file_content),
            AgentCommand::Unknown(name) => Err(DocSweepError::Error(format!(
                "unknown command '{}'",
                name
            ))),
        }
    }

    fn list_files(path: &Path) -> Result<Value, DocSweepError> {
        Ok(serde_json::to_value(list_directory(path)?)?)
    }

    fn download_file(&self, path: &Path) -> Result<Value, DocSweepError> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(DocSweepError::Error(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if metadata.len() > self.max_download_bytes {
            return Err(DocSweepError::Error(format!(
                "{} is {} bytes, above the {} byte download limit",
                path.display(),
                metadata.len(),
                self.max_download_bytes
            )));
        }

        let bytes = fs::read(path)?;
        let downloaded = DownloadedFile {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: bytes.len() as u64,
            file_content: BASE64.encode(&bytes),
            modified: unix_modified(&metadata),
        };
        Ok(serde_json::to_value(downloaded)?)
    }

    fn upload_file(path: &Path, file_content: &str) -> Result<Value, DocSweepError> {
        let bytes = BASE64
            .decode(file_content)
            .map_err(|e| DocSweepError::Error(format!("file_content is not valid base64: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, &bytes)?;

        Ok(serde_json::json!({
            "path": path.to_string_lossy(),
            "size": bytes.len(),
        }))
    }
}

/// One level of `path`, sorted by name. Entries whose metadata cannot be read are skipped.
pub fn list_directory(path: &Path) -> Result<Vec<RemoteFileEntry>, DocSweepError> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(path)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry in {}: {}", path.display(), e);
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        entries.push(RemoteFileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: unix_modified(&metadata),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn unix_modified(metadata: &fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

/// Turn one inbound command frame into its result. Never fails: decoding
/// problems, handler errors and handler panics all become `failed` results.
pub async fn handle_command(executor: Arc<CommandExecutor>, frame: CommandFrame) -> CommandResultFrame {
    let command_id = frame.command_id.clone();

    let command = match AgentCommand::from_frame(&frame) {
        Ok(AgentCommand::Unknown(name)) => {
            warn!("Rejecting unknown command '{}' ({})", name, command_id);
            return CommandResultFrame::failed(command_id, format!("unknown command '{}'", name));
        }
        Ok(command) => command,
        Err(message) => return CommandResultFrame::failed(command_id, message),
    };

    let name = command.name().to_string();
    debug!("Executing {} ({})", name, command_id);

    run_handler(command_id, &name, move || executor.execute(&command)).await
}

async fn run_handler<F>(command_id: String, name: &str, handler: F) -> CommandResultFrame
where
    F: FnOnce() -> Result<Value, DocSweepError> + Send + 'static,
{
    match tokio::task::spawn_blocking(handler).await {
        Ok(Ok(data)) => CommandResultFrame::completed(command_id, data),
        Ok(Err(e)) => {
            warn!("{} ({}) failed: {}", name, command_id, e);
            CommandResultFrame::failed(command_id, e.to_string())
        }
        Err(join_error) => {
            warn!("{} ({}) handler crashed: {}", name, command_id, join_error);
            CommandResultFrame::failed(command_id, format!("handler crashed: {}", join_error))
        }
    }
}
