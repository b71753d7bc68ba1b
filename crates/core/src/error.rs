use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("No cluster info for key {0}")]
    MissingCluster(String),

    #[error("Malformed signal field {field}: {reason}")]
    MalformedSignal { field: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Plugin {plugin} error: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TaskdError {
    pub fn malformed(field: &str, reason: impl std::fmt::Display) -> Self {
        Self::MalformedSignal {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn plugin(plugin: &str, reason: impl std::fmt::Display) -> Self {
        Self::Plugin {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }
}
