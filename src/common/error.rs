//! Error types for the tunnel supervisor

use std::io;
use thiserror::Error;

/// Supervisor error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed connection descriptor
    #[error("Parse error: {0}")]
    Parse(String),

    /// The proxy engine rejected the generated document
    #[error("Config test failed: {0}")]
    ConfigTest(String),

    #[error("Engine start failed: {0}")]
    EngineStart(String),

    #[error("Interface allocation failed: {0}")]
    InterfaceAllocation(String),

    #[error("Forwarding engine load failed: {0}")]
    ForwardingEngineLoad(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn config_test<S: Into<String>>(msg: S) -> Self {
        Error::ConfigTest(msg.into())
    }

    pub fn engine_start<S: Into<String>>(msg: S) -> Self {
        Error::EngineStart(msg.into())
    }

    pub fn interface<S: Into<String>>(msg: S) -> Self {
        Error::InterfaceAllocation(msg.into())
    }

    pub fn forwarding_load<S: Into<String>>(msg: S) -> Self {
        Error::ForwardingEngineLoad(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Error::Store(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::parse("missing '@'");
        assert_eq!(e.to_string(), "Parse error: missing '@'");

        let e = Error::config_test("invalid outbound");
        assert_eq!(e.to_string(), "Config test failed: invalid outbound");
    }
}
