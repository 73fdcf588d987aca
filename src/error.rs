use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by instance supervision and the QMP transport.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("unsupported architecture `{arch}`")]
    UnsupportedArch { arch: String },

    #[error("QEMU binary not found")]
    QemuNotFound,

    #[error("failed to launch QEMU: {message}")]
    Spawn { message: String },

    #[error("QMP transport error: {message}")]
    Transport { message: String },

    /// The server answered with an `error` object; class and description are
    /// passed through verbatim.
    #[error("QMP error [{class}]: {desc}")]
    Qmp { class: String, desc: String },

    #[error("timed out: {message}")]
    Timeout { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not connected to QEMU")]
    NotConnected,

    #[error("OS error: {message}")]
    Os { message: String },
}

impl Error {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn spawn(message: impl Into<String>) -> Self {
        Error::Spawn {
            message: message.into(),
        }
    }

    pub(crate) fn os(message: impl Into<String>) -> Self {
        Error::Os {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }
}
