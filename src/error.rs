//! Error taxonomy for adapter, bus and external-tool failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No object exposing the adapter interface could be located on the
    /// bus.
    #[error("unable to find a usable bluetooth adapter")]
    NoAdapterFound,

    /// A required privileged CLI tool is not installed.
    #[error("`{tool}` is not available on this system; {hint}")]
    ToolMissing {
        tool: &'static str,
        hint: &'static str,
    },

    /// A privileged operation was attempted without an effective uid of
    /// root.
    #[error("{operation} requires root privileges; re-run elevated")]
    PermissionDenied { operation: &'static str },

    /// An external tool ran but reported an error.
    #[error("`{tool}` failed: {stderr}")]
    CommandFailed { tool: String, stderr: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The bluetooth unit file carries no `ExecStart` line to build the
    /// compatibility override from.
    #[error("bluetooth service unit has no ExecStart line")]
    UnitFileMalformed,

    /// Transport-level D-Bus failure. The owning connection should be
    /// treated as dead and reconstructed by the caller rather than
    /// retried indefinitely.
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zbus::fdo::Error> for Error {
    fn from(err: zbus::fdo::Error) -> Self {
        Error::Bus(zbus::Error::from(err))
    }
}

impl From<zbus::zvariant::Error> for Error {
    fn from(err: zbus::zvariant::Error) -> Self {
        Error::Bus(zbus::Error::from(err))
    }
}
