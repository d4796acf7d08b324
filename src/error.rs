use thiserror::Error;

#[derive(Error, Debug)]
pub enum NcpError {
    #[error("Invalid address format {input:?}: {reason}")]
    InvalidFormat { input: String, reason: String },

    #[error("Transmit failed: {0}")]
    TransmitFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Failed to initialize {resource}: {reason}")]
    ResourceInit { resource: String, reason: String },

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),
}

impl NcpError {
    pub(crate) fn resource_init(resource: &str, reason: impl ToString) -> Self {
        NcpError::ResourceInit {
            resource: resource.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NcpError>;
