//! Error types for polyp operations.
//!
//! Every failure the driver can report to the engine is one variant of
//! [`PolypError`]. The `Display` output of each variant is what the engine
//! shows to the user, so the messages are kept short and literal.

use std::io;
use thiserror::Error;

/// Result type alias for polyp operations.
pub type PolypResult<T> = Result<T, PolypError>;

/// Errors that can occur while managing networks and endpoints.
#[derive(Debug, Error)]
pub enum PolypError {
    /// A required option was not supplied.
    #[error("param {0} not given")]
    MissingParam(String),

    /// The engine did not pass the generic option map at all.
    #[error("parameter map not passed from engine")]
    MissingParameterMap,

    /// An option was supplied but could not be parsed.
    #[error("failed to parse {field} value: {value} ({message})")]
    InvalidParam {
        /// The option name.
        field: String,
        /// The raw value as received.
        value: String,
        /// Why parsing failed.
        message: String,
    },

    /// Network unknown locally and in the shared store.
    #[error("no such network: {0}")]
    NoSuchNetwork(String),

    /// Endpoint unknown within its network.
    #[error("no such endpoint: {0}")]
    NoSuchEndpoint(String),

    /// Endpoint identifier already registered.
    #[error("endpoint already exists: {0}")]
    EndpointExists(String),

    /// Network identifier already known locally or remotely.
    #[error("should not re-create existing network {0}")]
    NetworkExists(String),

    /// Endpoint request without interface information.
    #[error("invalid interface info passed: {0}")]
    InvalidInterface(String),

    /// IPAM data rejected.
    #[error("ipam: {0}")]
    Ipam(String),

    /// IPv6 was requested for a network or endpoint.
    #[error("IPv6 is not supported by this driver")]
    Ipv6Unsupported,

    /// A link operation (vlan, bridge, veth) failed.
    #[error("netlink: {action} error: {message}")]
    Link {
        /// The attempted action, e.g. "create bridge".
        action: String,
        /// The underlying OS error.
        message: String,
    },

    /// `ip` could not be started.
    #[error("failed to run '{command}': {source}")]
    CommandSpawn {
        /// The command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// `ip` exited non-zero.
    #[error("`{command}` exited with {exit_code}: {output}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// What the command printed on stderr.
        output: String,
    },

    /// Shared store read, write or watch failed.
    #[error("store {operation} failed: {message}")]
    Store {
        /// The operation that failed (e.g. "get", "put", "watch").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl PolypError {
    /// Creates a missing parameter error.
    pub fn missing_param(name: impl Into<String>) -> Self {
        Self::MissingParam(name.into())
    }

    /// Creates an invalid parameter error.
    pub fn invalid_param(
        field: impl Into<String>,
        value: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::InvalidParam {
            field: field.into(),
            value: value.into(),
            message: message.to_string(),
        }
    }

    /// Wraps any error as a failed link action.
    pub fn link(action: impl Into<String>, err: impl ToString) -> Self {
        Self::Link {
            action: action.into(),
            message: err.to_string(),
        }
    }

    /// Creates a store error.
    pub fn store(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for "no such network" / "no such endpoint".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PolypError::NoSuchNetwork(_) | PolypError::NoSuchEndpoint(_)
        )
    }

    /// Returns true when an identifier is already taken.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PolypError::EndpointExists(_) | PolypError::NetworkExists(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_param_names_the_option() {
        let err = PolypError::missing_param("vlan");
        assert_eq!(err.to_string(), "param vlan not given");
    }

    #[test]
    fn test_missing_parameter_map_is_distinct() {
        let err = PolypError::MissingParameterMap;
        assert_eq!(err.to_string(), "parameter map not passed from engine");
        assert!(!matches!(err, PolypError::MissingParam(_)));
    }

    #[test]
    fn test_link_error_carries_action() {
        let err = PolypError::link("create bridge", "Operation not permitted");
        assert_eq!(
            err.to_string(),
            "netlink: create bridge error: Operation not permitted"
        );
    }

    #[test]
    fn test_invalid_param() {
        let err = PolypError::invalid_param("vlan", "abc", "invalid digit found in string");
        assert!(err.to_string().contains("vlan"));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_classification() {
        assert!(PolypError::NoSuchNetwork("n1".into()).is_not_found());
        assert!(PolypError::NoSuchEndpoint("e1".into()).is_not_found());
        assert!(PolypError::EndpointExists("e1".into()).is_conflict());
        assert!(!PolypError::internal("bug").is_not_found());
        assert!(!PolypError::store("get", "timeout").is_conflict());
    }
}
