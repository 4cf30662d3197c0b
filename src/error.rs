use thiserror::Error;

/// Errors that can occur inside the gateway and its collaborators
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid service name: {name}")]
    InvalidServiceName { name: String },

    #[error("Service already registered: {name}")]
    ServiceAlreadyRegistered { name: String },

    #[error("Invalid capacity: {capacity}")]
    InvalidCapacity { capacity: usize },

    #[error("{message}")]
    Backend { message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Invalid store key: {key}")]
    InvalidKey { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl GatewayError {
    /// Shorthand for a backend failure carrying only a message
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
