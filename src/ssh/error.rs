//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Local port {0} already in use")]
    AddrInUse(u16),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether the local listener could not bind because the port is taken
    pub fn is_addr_in_use(&self) -> bool {
        match self {
            SshError::AddrInUse(_) => true,
            SshError::IoError(e) => e.kind() == std::io::ErrorKind::AddrInUse,
            _ => false,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_in_use_classification() {
        assert!(SshError::AddrInUse(9736).is_addr_in_use());
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken");
        assert!(SshError::IoError(io).is_addr_in_use());
        assert!(!SshError::AuthenticationFailed("denied".into()).is_addr_in_use());
    }
}
