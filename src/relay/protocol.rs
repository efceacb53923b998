//! Wire format spoken between the hub, its agents and the controller.
//!
//! Every frame is a JSON text message carrying a `type` discriminator. The hub
//! itself mostly forwards frames as raw JSON values; the typed forms here are
//! what agents and the controller produce and consume.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TYPE_REGISTER: &str = "register";
pub const TYPE_AUTH_SUCCESS: &str = "auth_success";
pub const TYPE_UPDATE_METRICS: &str = "update_metrics";
pub const TYPE_METRICS: &str = "metrics";
pub const TYPE_COMMAND: &str = "command";
pub const TYPE_COMMAND_RESULT: &str = "command_result";

/// Largest WebSocket frame or message any peer accepts. Frames are never
/// fragmented, so a whole base64 file transfer must fit in one.
pub const MAX_FRAME_BYTES: usize = 96 * 1024 * 1024;

/// Room reserved in a frame for the JSON envelope around a file body
const FRAME_ENVELOPE_BYTES: usize = 64 * 1024;

/// Largest file whose base64 encoding still fits in one frame
pub const fn max_transfer_bytes() -> u64 {
    ((MAX_FRAME_BYTES - FRAME_ENVELOPE_BYTES) / 4 * 3) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Agent,
    Controller,
}

/// Connection class of an authenticated peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRole {
    Agent { hostname: String },
    Controller,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register(RegisterFrame),
    AuthSuccess,
    UpdateMetrics(MetricsFrame),
    Metrics(MetricsFrame),
    Command(CommandFrame),
    CommandResult(CommandResultFrame),
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// First frame of every connection. Fields stay loosely typed so the hub can
/// tell a bad `client_type` apart from a malformed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFrame {
    pub client_type: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl RegisterFrame {
    pub fn new(client_type: ClientType, token: &str, hostname: Option<&str>) -> Self {
        let client_type = match client_type {
            ClientType::Agent => "agent",
            ClientType::Controller => "controller",
        };
        RegisterFrame {
            client_type: client_type.to_string(),
            token: Some(token.to_string()),
            hostname: hostname.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuMetrics {
    pub model: String,
    pub cores: usize,
    pub threads: usize,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetrics {
    pub total: u64,
    pub used: u64,
    pub percent: f32,
}

impl UsageMetrics {
    pub fn new(total: u64, used: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0) as f32
        };
        UsageMetrics {
            total,
            used,
            percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMetrics {
    pub device_class: String,
    pub boot_time: u64,
    pub uptime: u64,
    pub os_version: String,
    pub logged_in_user: String,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        SystemMetrics {
            device_class: UNKNOWN.to_string(),
            boot_time: 0,
            uptime: 0,
            os_version: UNKNOWN.to_string(),
            logged_in_user: UNKNOWN.to_string(),
        }
    }
}

pub const UNKNOWN: &str = "Unknown";

/// One metrics report from an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu: CpuMetrics,
    pub memory: UsageMetrics,
    pub disk: UsageMetrics,
    pub system: SystemMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Set by the hub when it re-envelopes the report for the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_at: Option<String>,
    #[serde(default)]
    pub cpu: CpuMetrics,
    #[serde(default)]
    pub memory: UsageMetrics,
    #[serde(default)]
    pub disk: UsageMetrics,
    #[serde(default)]
    pub system: SystemMetrics,
}

impl MetricsFrame {
    pub fn from_snapshot(hostname: Option<String>, snapshot: MetricsSnapshot) -> Self {
        MetricsFrame {
            hostname,
            forwarded_at: None,
            cpu: snapshot.cpu,
            memory: snapshot.memory,
            disk: snapshot.disk,
            system: snapshot.system,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
            disk: self.disk.clone(),
            system: self.system.clone(),
        }
    }
}

/// A command as it travels on the wire. `hostname` is the routing target and
/// is only meaningful between the controller and the hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub command: String,
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Base64 file body for uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultFrame {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub data: Value,
}

impl CommandResultFrame {
    pub fn completed(command_id: impl Into<String>, data: Value) -> Self {
        CommandResultFrame {
            command_id: command_id.into(),
            status: CommandStatus::Completed,
            data,
        }
    }

    pub fn failed(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        CommandResultFrame {
            command_id: command_id.into(),
            status: CommandStatus::Failed,
            data: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }
}

/// Filesystem operations an agent can be asked to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    ListFiles { path: String },
    DownloadFile { remote_path: String },
    UploadFile { remote_path: String, file_content: String },
    Unknown(String),
}

impl AgentCommand {
    pub const LIST_FILES: &str = "list_files";
    pub const DOWNLOAD_FILE: &str = "download_file";
    pub const UPLOAD_FILE: &str = "upload_file";

    /// Decode the command carried by a frame. Unrecognised names become
    /// `Unknown`; a recognised name missing a required field is an error.
    pub fn from_frame(frame: &CommandFrame) -> Result<Self, String> {
        fn required(value: &Option<String>, command: &str, field: &str) -> Result<String, String> {
            value
                .clone()
                .ok_or_else(|| format!("{} requires '{}'", command, field))
        }

        match frame.command.as_str() {
            Self::LIST_FILES => Ok(AgentCommand::ListFiles {
                path: required(&frame.path, Self::LIST_FILES, "path")?,
            }),
            Self::DOWNLOAD_FILE => Ok(AgentCommand::DownloadFile {
                remote_path: frame
                    .remote_path
                    .clone()
                    .or_else(|| frame.path.clone())
                    .ok_or_else(|| format!("{} requires 'remote_path'", Self::DOWNLOAD_FILE))?,
            }),
            Self::UPLOAD_FILE => Ok(AgentCommand::UploadFile {
                remote_path: required(&frame.remote_path, Self::UPLOAD_FILE, "remote_path")?,
                file_content: required(&frame.file_content, Self::UPLOAD_FILE, "file_content")?,
            }),
            other => Ok(AgentCommand::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AgentCommand::ListFiles { .. } => Self::LIST_FILES,
            AgentCommand::DownloadFile { .. } => Self::DOWNLOAD_FILE,
            AgentCommand::UploadFile { .. } => Self::UPLOAD_FILE,
            AgentCommand::Unknown(name) => name,
        }
    }

    pub fn into_frame(self, command_id: String, hostname: Option<String>) -> CommandFrame {
        let mut frame = CommandFrame {
            hostname,
            command: self.name().to_string(),
            command_id,
            ..CommandFrame::default()
        };
        match self {
            AgentCommand::ListFiles { path } => frame.path = Some(path),
            AgentCommand::DownloadFile { remote_path } => frame.remote_path = Some(remote_path),
            AgentCommand::UploadFile {
                remote_path,
                file_content,
            } => {
                frame.remote_path = Some(remote_path);
                frame.file_content = Some(file_content);
            }
            AgentCommand::Unknown(_) => {}
        }
        frame
    }
}

/// Entry returned by `list_files`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Unix seconds, when the agent could read it
    pub modified: Option<i64>,
}

/// Payload of a completed `download_file`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub file_name: String,
    pub size: u64,
    pub file_content: String,
    pub modified: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_frame_wire_shape() {
        let frame = Frame::Register(RegisterFrame::new(ClientType::Agent, "s3cret", Some("PC1")));
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "register", "client_type": "agent", "token": "s3cret", "hostname": "PC1"})
        );
    }

    #[test]
    fn test_auth_success_parses() {
        let frame: Frame = serde_json::from_str(r#"{"type":"auth_success"}"#).unwrap();
        assert!(matches!(frame, Frame::AuthSuccess));
    }

    #[test]
    fn test_command_decoding() {
        let frame: CommandFrame = serde_json::from_value(json!({
            "command": "list_files", "command_id": "c1", "path": "C:\\Users"
        }))
        .unwrap();
        assert_eq!(
            AgentCommand::from_frame(&frame).unwrap(),
            AgentCommand::ListFiles {
                path: "C:\\Users".to_string()
            }
        );

        let unknown = CommandFrame {
            command: "format_disk".to_string(),
            command_id: "c2".to_string(),
            ..CommandFrame::default()
        };
        assert_eq!(
            AgentCommand::from_frame(&unknown).unwrap(),
            AgentCommand::Unknown("format_disk".to_string())
        );

        let missing = CommandFrame {
            command: "upload_file".to_string(),
            command_id: "c3".to_string(),
            remote_path: Some("C:\\x.pdf".to_string()),
            ..CommandFrame::default()
        };
        assert!(AgentCommand::from_frame(&missing).is_err());
    }

    #[test]
    fn test_metrics_frame_tolerates_missing_sections() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "update_metrics",
            "cpu": {"model": "Xeon", "cores": 4, "threads": 8, "percent": 12.5}
        }))
        .unwrap();
        match frame {
            Frame::UpdateMetrics(metrics) => {
                assert_eq!(metrics.cpu.threads, 8);
                assert_eq!(metrics.system.logged_in_user, UNKNOWN);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_usage_percent() {
        assert_eq!(UsageMetrics::new(0, 0).percent, 0.0);
        assert_eq!(UsageMetrics::new(200, 50).percent, 25.0);
    }
}
