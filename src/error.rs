//! Error types for the DHT node
//!
//! This module defines the error taxonomy shared by the routing table,
//! the bootstrap coordinator and the transport stack.

use std::fmt;

/// Error type for DHT operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// A node identifier had the wrong width or encoding
    InvalidIdentifier {
        message: String,
        source: Option<String>,
    },

    /// The target bucket is full and its oldest entry is still alive
    BucketFull {
        bucket: usize,
        peer: Option<String>,
    },

    /// None of the seed addresses could be reached
    BootstrapFailed {
        message: String,
        attempted: usize,
    },

    /// A lookup ran past its deadline
    LookupTimeout {
        target: String,
        rounds: usize,
    },

    /// Transport-level failure (dial, upgrade, read, write)
    ConnectionError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Malformed or unexpected wire message
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Address or value parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl DhtError {
    /// Create a new InvalidIdentifier error
    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        DhtError::InvalidIdentifier {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new InvalidIdentifier error with source
    pub fn invalid_identifier_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::InvalidIdentifier {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new BucketFull error naming the rejected peer
    pub fn bucket_full_with_peer(bucket: usize, peer: impl Into<String>) -> Self {
        DhtError::BucketFull {
            bucket,
            peer: Some(peer.into()),
        }
    }

    /// Create a new BootstrapFailed error
    pub fn bootstrap_failed(message: impl Into<String>, attempted: usize) -> Self {
        DhtError::BootstrapFailed {
            message: message.into(),
            attempted,
        }
    }

    /// Create a new LookupTimeout error
    pub fn lookup_timeout(target: impl Into<String>, rounds: usize) -> Self {
        DhtError::LookupTimeout {
            target: target.into(),
            rounds,
        }
    }

    /// Create a new ConnectionError
    pub fn connection_error(message: impl Into<String>) -> Self {
        DhtError::ConnectionError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new ConnectionError with address
    pub fn connection_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        DhtError::ConnectionError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new ConnectionError with address and source
    pub fn connection_error_full(
        message: impl Into<String>,
        address: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        DhtError::ConnectionError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        DhtError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Failures of the exchange itself rather than of what was exchanged;
    /// these are worth retrying.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DhtError::ConnectionError { .. } | DhtError::LookupTimeout { .. } | DhtError::ProtocolError { .. }
        )
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            DhtError::InvalidIdentifier { source, .. }
            | DhtError::ConnectionError { source, .. }
            | DhtError::ProtocolError { source, .. }
            | DhtError::ParseError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::InvalidIdentifier { message, source } => {
                if let Some(src) = source {
                    write!(f, "Invalid identifier: {} (source: {})", message, src)
                } else {
                    write!(f, "Invalid identifier: {}", message)
                }
            }
            DhtError::BucketFull { bucket, peer } => {
                if let Some(p) = peer {
                    write!(f, "Bucket {} is full (rejected: {})", bucket, p)
                } else {
                    write!(f, "Bucket {} is full", bucket)
                }
            }
            DhtError::BootstrapFailed { message, attempted } => {
                write!(f, "Bootstrap failed: {} ({} seeds attempted)", message, attempted)
            }
            DhtError::LookupTimeout { target, rounds } => {
                write!(f, "Lookup timed out: target {} after {} rounds", target, rounds)
            }
            DhtError::ConnectionError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Connection error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Connection error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Connection error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Connection error: {}", message),
                }
            }
            DhtError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            DhtError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            DhtError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for DhtError {}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::ConnectionError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for DhtError {
    fn from(err: serde_bencode::Error) -> Self {
        DhtError::protocol_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<std::net::AddrParseError> for DhtError {
    fn from(err: std::net::AddrParseError) -> Self {
        DhtError::parse_error_with_source("Failed to parse address", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DhtError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DhtError::connection_error("Operation timed out")
    }
}
