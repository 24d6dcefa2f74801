use thiserror::Error;

/// Result type for smart clock operations
pub type Result<T> = std::result::Result<T, ClockError>;

/// Errors that can occur when talking to a smart clock or its broker
#[derive(Error, Debug)]
pub enum ClockError {
    /// HTTP transport failure talking to the device
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// MQTT client request could not be queued
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Device or broker unreachable while setting up a session
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timed out waiting for a session to be established
    #[error("Connection timeout")]
    Timeout,

    /// No device selected or no broker session
    #[error("Not connected")]
    NotConnected,

    /// Caller supplied a value the device cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}
