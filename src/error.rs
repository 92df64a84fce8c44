use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForceError {
    /// Invalid state transition (start with nothing available, tare while idle, ...).
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Parameters outside their valid range.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Hardware connect/read failure, recoverable per sensor.
    #[error("device error on {sensor}: {reason}")]
    Device { sensor: String, reason: String },
    #[error("no derived metric named {0}")]
    UnknownFigure(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config value error: {0}")]
    Value(#[from] serde_json::Error),
}

impl ForceError {
    pub fn device(sensor: &str, reason: impl Into<String>) -> Self {
        ForceError::Device {
            sensor: sensor.to_owned(),
            reason: reason.into(),
        }
    }
}

