use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocSweepError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into DocSweepError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("PDF error: {0}")]
    PdfError(#[from] lopdf::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Bad or missing token, or a malformed registration
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Socket loss or a peer that never answered
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A failure confined to one endpoint of a scan run
    #[error("Endpoint '{endpoint}' failed: {message}")]
    EndpointScan { endpoint: String, message: String },

    #[error("Schedule conflict: {0}")]
    ScheduleConflict(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<tokio_tungstenite::tungstenite::Error> for DocSweepError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        DocSweepError::WebSocketError(Box::new(err))
    }
}

impl DocSweepError {
    pub fn endpoint(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        DocSweepError::EndpointScan {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}
