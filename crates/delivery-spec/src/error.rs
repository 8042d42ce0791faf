use thiserror::Error;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Terminal failure of a delivery run. None of these are retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Unknown task or server, unresolved `via` link, `via` cycle, invalid config value.
    #[error("config error: {0}")]
    Config(String),
    /// SSH handshake or SOCKS proxy failure.
    #[error("connection error: {0}")]
    Connection(String),
    /// Archive creation, upload or remote unpack I/O failure.
    #[error("transfer error: {0}")]
    Transfer(String),
    /// Non-zero exit of a hook command or of the remote unpack script.
    #[error("command error: {0}")]
    Command(String),
}

impl DeliveryError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Config(message)
            | Self::Connection(message)
            | Self::Transfer(message)
            | Self::Command(message) => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_single_line_with_kind_prefix() {
        let err = DeliveryError::config("unknown task");
        assert_eq!(err.to_string(), "config error: unknown task");
        assert_eq!(err.message(), "unknown task");
        assert!(!err.to_string().contains('\n'));
    }
}
