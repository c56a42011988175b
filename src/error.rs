use derive_more::derive::{Display, Error};

/// A specialized `Result` where the error is this crate's `Error` type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Define a unified error type for this crate.
///
/// Malformed network input (bad DNS datagrams, bad percent-escapes, bad HTTP requests) is
/// absorbed where it arrives and never shows up here.
#[expect(missing_docs, reason = "The variants are self-explanatory.")]
#[derive(Debug, Display, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // `#[error(not(source))]` below tells `derive_more` that `embassy_executor::SpawnError` does
    // not implement Rust's `core::error::Error` trait.
    #[cfg(feature = "wifi")]
    #[display("{_0:?}")]
    TaskSpawn(#[error(not(source))] embassy_executor::SpawnError),

    #[display("Unable to bind UDP/TCP port {_0}")]
    SocketBind(#[error(not(source))] u16),

    #[display("Socket closed or failed")]
    Socket,

    #[display("Unable to start wifi AP")]
    AccessPoint,

    #[display("Unable to configure wifi station")]
    Station,

    #[display("Timed out waiting for IP address assignment")]
    AddressTimeout,

    #[display("Timed out waiting for NTP clock update")]
    TimeSyncTimeout,

    #[display("Time sync failed: {_0}")]
    TimeSync(#[error(not(source))] &'static str),

    #[display("Format error")]
    FormatError,

    #[display("Unable to write credentials to storage")]
    Storage,

    #[cfg(feature = "pico1")]
    #[display("Flash operation failed: {_0:?}")]
    Flash(#[error(not(source))] embassy_rp::flash::Error),

    #[display("Credential storage is invalid")]
    StorageCorrupted,
}

impl Error {
    /// Timeouts are recoverable: the caller falls back to the other mode instead of giving up.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::AddressTimeout | Self::TimeSyncTimeout)
    }
}

#[cfg(feature = "wifi")]
impl From<embassy_executor::SpawnError> for Error {
    fn from(err: embassy_executor::SpawnError) -> Self {
        Self::TaskSpawn(err)
    }
}
