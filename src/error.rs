//! Error types for tuntap-ctl

use std::io;
use thiserror::Error;

/// Result type alias for device management operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating, opening, configuring or driving a device.
///
/// Everything except [`Error::DeviceUnavailable`] is fatal for the device:
/// the caller is expected to log it and give up on the tunnel.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Inconsistent or incomplete device configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// An ifconfig parameter could not be parsed or resolved
    #[error("failed to resolve '{host}': {reason}")]
    Resolve { host: String, reason: String },

    /// Addresses that the selected topology cannot express
    #[error("topology error: {0}")]
    Topology(String),

    /// The device node or adapter could not be opened
    #[error("cannot open TUN/TAP dev {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The device is missing but may appear later, the caller may retry
    #[error("device {0} is not available")]
    DeviceUnavailable(String),

    /// Every dynamic unit or candidate adapter was tried
    #[error("cannot allocate TUN/TAP dev dynamically: {0}")]
    Exhausted(String),

    /// A required driver control request failed
    #[error("driver request {request} failed: {source}")]
    Driver {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    /// Installed driver is too old
    #[error("driver version {major}.{minor} is too old, need at least {min_major}.{min_minor}")]
    DriverVersion {
        major: u32,
        minor: u32,
        min_major: u32,
        min_minor: u32,
    },

    /// An external configuration command failed
    #[error("command failed: {command}: {reason}")]
    Command { command: String, reason: String },

    /// An external configuration command failed on every attempt
    #[error("command failed after {attempts} attempts: {command}")]
    RetriesExhausted { command: String, attempts: u32 },

    /// A registry or adapter lookup failed
    #[error("adapter error: {0}")]
    Adapter(String),

    /// More than one adapter matches and none was named explicitly
    #[error("{0}")]
    Ambiguous(String),

    /// DHCP option stream could not be built
    #[error("DHCP option error: {0}")]
    DhcpOptions(String),

    /// Operation issued in the wrong lifecycle state
    #[error("invalid state: {0}")]
    State(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Returns false only for conditions a caller may retry later.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::DeviceUnavailable(_))
    }

    /// Check if the error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DeviceUnavailable(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
            || matches!(self, Error::Open { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::Open { source, .. } => source,
            Error::Driver { source, .. } => source,
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(!Error::DeviceUnavailable("tun0".into()).is_fatal());
        assert!(Error::Topology("x".into()).is_fatal());
        assert!(Error::Exhausted("/dev/tun".into()).is_fatal());
    }

    #[test]
    fn not_found_detection() {
        let e = Error::Open {
            path: "/dev/net/tun".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(e.is_not_found());
        assert!(e.to_string().contains("/dev/net/tun"));
        assert!(!Error::Config("x".into()).is_not_found());
    }
}
