//! Network Time Protocol (NTP) time synchronization.
//!
//! [`TimeSource`] is what the onboarding coordinator waits on after the station gets an
//! address. [`NtpTimeSource`] (feature `wifi`) asks a public NTP pool over the embassy-net
//! stack.

#![allow(clippy::future_not_send, reason = "single-threaded")]

use crate::unix_seconds::UnixSeconds;
use crate::{Error, Result};

/// Size of an NTP packet without extensions.
pub const NTP_PACKET_LEN: usize = 48;
/// Standard NTP port.
pub const NTP_PORT: u16 = 123;

const TRANSMIT_TIMESTAMP_OFFSET: usize = 40;

/// One attempt at learning the current wall-clock time.
#[allow(async_fn_in_trait, reason = "single-threaded executor")]
pub trait TimeSource {
    /// Query the time service once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimeSync`] when the service cannot be reached or answers nonsense.
    async fn synchronize(&mut self) -> Result<UnixSeconds>;
}

/// Build a Network Time Protocol (NTP) client request (version 3, client mode).
#[must_use]
pub const fn ntp_request() -> [u8; NTP_PACKET_LEN] {
    let mut request = [0u8; NTP_PACKET_LEN];
    request[0] = 0x1B; // LI=0, VN=3, Mode=3 (client)
    request
}

/// Extract the transmit timestamp from a server reply.
///
/// # Errors
///
/// Returns [`Error::TimeSync`] for short replies and timestamps before 1970.
pub fn parse_ntp_response(response: &[u8]) -> Result<UnixSeconds> {
    if response.len() < NTP_PACKET_LEN {
        warn!(
            "Network Time Protocol (NTP) response too short: {} bytes",
            response.len()
        );
        return Err(Error::TimeSync("NTP response too short"));
    }
    let seconds = response
        .get(TRANSMIT_TIMESTAMP_OFFSET..TRANSMIT_TIMESTAMP_OFFSET + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(Error::TimeSync("NTP response too short"))?;
    UnixSeconds::from_ntp_seconds(seconds).ok_or(Error::TimeSync("Invalid NTP timestamp"))
}

#[cfg(feature = "wifi")]
mod wifi_impl {
    use embassy_net::dns::DnsQueryType;
    use embassy_net::udp::{PacketMetadata, UdpSocket};
    use embassy_net::Stack;
    use embassy_time::{Duration, with_timeout};

    use super::{NTP_PACKET_LEN, NTP_PORT, TimeSource, ntp_request, parse_ntp_response};
    use crate::unix_seconds::UnixSeconds;
    use crate::{Error, Result};

    const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

    /// [`TimeSource`] that queries an NTP server over an embassy-net stack.
    pub struct NtpTimeSource {
        stack: Stack<'static>,
        server: &'static str,
    }

    impl NtpTimeSource {
        /// Query `server` (a host name, e.g. `pool.ntp.org`) through `stack`.
        #[must_use]
        pub const fn new(stack: Stack<'static>, server: &'static str) -> Self {
            Self { stack, server }
        }
    }

    impl TimeSource for NtpTimeSource {
        async fn synchronize(&mut self) -> Result<UnixSeconds> {
            info!(
                "Resolving Network Time Protocol (NTP) host {}...",
                self.server
            );
            let addresses = self
                .stack
                .dns_query(self.server, DnsQueryType::A)
                .await
                .map_err(|_| Error::TimeSync("DNS lookup failed"))?;
            let server_addr = *addresses
                .first()
                .ok_or(Error::TimeSync("No DNS results"))?;

            let mut rx_meta = [PacketMetadata::EMPTY; 1];
            let mut rx_buffer = [0; 128];
            let mut tx_meta = [PacketMetadata::EMPTY; 1];
            let mut tx_buffer = [0; 128];
            let mut socket = UdpSocket::new(
                self.stack,
                &mut rx_meta,
                &mut rx_buffer,
                &mut tx_meta,
                &mut tx_buffer,
            );
            socket
                .bind(0)
                .map_err(|_| Error::TimeSync("Socket bind failed"))?;

            socket
                .send_to(&ntp_request(), (server_addr, NTP_PORT))
                .await
                .map_err(|_| Error::TimeSync("NTP send failed"))?;

            let mut response = [0u8; NTP_PACKET_LEN];
            let (len, _from) = with_timeout(RECEIVE_TIMEOUT, socket.recv_from(&mut response))
                .await
                .map_err(|_| Error::TimeSync("NTP receive timeout"))?
                .map_err(|_| Error::TimeSync("NTP receive failed"))?;

            let unix_time = parse_ntp_response(response.get(..len).unwrap_or_default())?;
            info!(
                "Network Time Protocol (NTP) time: {} (unix timestamp)",
                unix_time.as_i64()
            );
            Ok(unix_time)
        }
    }
}

#[cfg(feature = "wifi")]
pub use wifi_impl::NtpTimeSource;
