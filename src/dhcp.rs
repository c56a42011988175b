//! Simple DHCP server for captive portal mode
//!
//! Provides IP address leases to the client connecting to the setup access point. Every
//! lease names the device as router and DNS server and carries the captive-portal URI
//! (DHCP option 114, RFC 8910) so clients can open the configuration page directly.

#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

/// DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// DHCP client port replies are broadcast to.
pub const DHCP_CLIENT_PORT: u16 = 68;
/// Size of the receive and reply buffers.
pub const DHCP_FRAME_LEN: usize = 768;
/// Longest captive-portal URI advertised.
pub const PORTAL_URI_MAX_LEN: usize = 32;

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_MIN_FRAME: usize = 240;
const DHCP_MIN_REPLY: usize = 300;
const DHCP_LEASE_SECONDS: u32 = 30; // Short lease keeps captive portal clients refreshing quickly
const DHCP_RENEWAL_SECONDS: u32 = DHCP_LEASE_SECONDS / 2;
const DHCP_REBINDING_SECONDS: u32 = DHCP_LEASE_SECONDS / 8 * 7;
const POOL_SIZE: u8 = 4;
const MAX_LEASES: usize = POOL_SIZE as usize;

const DHCP_OFFER: u8 = 2;
const DHCP_ACK: u8 = 5;
const DHCP_NAK: u8 = 6;

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS_SERVER: u8 = 6;
const OPTION_BROADCAST: u8 = 28;
const OPTION_REQUESTED_IP: u8 = 50;
const OPTION_LEASE_TIME: u8 = 51;
const OPTION_MESSAGE_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_RENEWAL_TIME: u8 = 58;
const OPTION_REBINDING_TIME: u8 = 59;
const OPTION_CAPTIVE_PORTAL: u8 = 114;
const OPTION_END: u8 = 255;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum DhcpMessageType {
    Discover,
    Request,
    Decline,
    Release,
    Inform,
    Other(u8),
}

struct DhcpMessage {
    msg_type: DhcpMessageType,
    transaction_id: u32,
    hardware_type: u8,
    hardware_len: u8,
    flags: u16,
    client_mac: [u8; 6],
    client_ip: Option<Ipv4Addr>,
    requested_ip: Option<Ipv4Addr>,
    server_id: Option<Ipv4Addr>,
}

struct DhcpLease {
    mac: [u8; 6],
    ip: Ipv4Addr,
    expires_at: Instant,
}

fn ipv4_at(frame: &[u8], at: usize) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = frame.get(at..at.checked_add(4)?)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn parse_dhcp_message(frame: &[u8]) -> Option<DhcpMessage> {
    if frame.len() < DHCP_MIN_FRAME {
        return None;
    }

    if *frame.first()? != 1 {
        // Only process BOOTREQUEST packets
        return None;
    }

    let hardware_type = *frame.get(1)?;
    let hardware_len = *frame.get(2)?;
    if hardware_type != 1 || hardware_len != 6 {
        // Only support Ethernet clients with 6-byte MACs
        return None;
    }

    let transaction_id = u32::from_be_bytes(frame.get(4..8)?.try_into().ok()?);
    let flags = u16::from_be_bytes(frame.get(10..12)?.try_into().ok()?);

    if frame.get(236..240)? != DHCP_MAGIC_COOKIE {
        return None;
    }

    let mut msg_type = None;
    let mut requested_ip = None;
    let mut server_id = None;

    let mut idx = DHCP_MIN_FRAME;
    while let Some(&opt) = frame.get(idx) {
        idx = idx.saturating_add(1);
        match opt {
            OPTION_PAD => continue,
            OPTION_END => break,
            _ => {
                let Some(&len) = frame.get(idx) else {
                    break;
                };
                let len = usize::from(len);
                let start = idx.saturating_add(1);
                let end = start.saturating_add(len);
                let Some(data) = frame.get(start..end) else {
                    break;
                };
                match (opt, data) {
                    (OPTION_REQUESTED_IP, _) if len == 4 => requested_ip = ipv4_at(data, 0),
                    (OPTION_MESSAGE_TYPE, &[code]) => {
                        msg_type = Some(match code {
                            1 => DhcpMessageType::Discover,
                            3 => DhcpMessageType::Request,
                            4 => DhcpMessageType::Decline,
                            7 => DhcpMessageType::Release,
                            8 => DhcpMessageType::Inform,
                            other => DhcpMessageType::Other(other),
                        });
                    }
                    (OPTION_SERVER_ID, _) if len == 4 => server_id = ipv4_at(data, 0),
                    _ => {}
                }
                idx = end;
            }
        }
    }

    let client_ip = ipv4_at(frame, 12).filter(|ip| !ip.is_unspecified());
    let client_mac: [u8; 6] = frame.get(28..34)?.try_into().ok()?;

    Some(DhcpMessage {
        msg_type: msg_type?,
        transaction_id,
        hardware_type,
        hardware_len,
        flags,
        client_mac,
        client_ip,
        requested_ip,
        server_id,
    })
}

fn append_option(dest: &mut [u8], idx: &mut usize, code: u8, payload: &[u8]) -> Option<()> {
    let payload_len = u8::try_from(payload.len()).ok()?;
    let end = idx.checked_add(payload.len())?.checked_add(2)?;
    let slot = dest.get_mut(*idx..end)?;
    let (head, body) = slot.split_at_mut(2);
    head.copy_from_slice(&[code, payload_len]);
    body.copy_from_slice(payload);
    *idx = end;
    Some(())
}

fn put(dest: &mut [u8], at: usize, bytes: &[u8]) -> Option<()> {
    dest.get_mut(at..at.checked_add(bytes.len())?)?
        .copy_from_slice(bytes);
    Some(())
}

/// Sans-IO DHCP server state: the address pool, active leases and advertised options.
pub struct DhcpServer {
    server_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    pool_start: Ipv4Addr,
    portal_uri: String<PORTAL_URI_MAX_LEN>,
    leases: Vec<DhcpLease, MAX_LEASES>,
}

impl DhcpServer {
    /// Serve a /24 around `server_ip`, leasing the addresses right after it.
    ///
    /// `portal_uri` is truncated to [`PORTAL_URI_MAX_LEN`] bytes.
    #[must_use]
    pub fn new(server_ip: Ipv4Addr, portal_uri: &str) -> Self {
        let mut uri = String::new();
        for ch in portal_uri.chars() {
            if uri.push(ch).is_err() {
                break;
            }
        }
        Self {
            server_ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::from(u32::from(server_ip).saturating_add(1)),
            portal_uri: uri,
            leases: Vec::new(),
        }
    }

    /// The subnet broadcast address replies are sent to.
    #[must_use]
    pub fn broadcast_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.server_ip) | !u32::from(self.netmask))
    }

    /// Address currently leased to `mac`, if any.
    #[must_use]
    pub fn lease_for(&self, mac: [u8; 6]) -> Option<Ipv4Addr> {
        self.leases
            .iter()
            .find(|lease| lease.mac == mac)
            .map(|lease| lease.ip)
    }

    /// Handle one request frame and build the reply into `reply`.
    ///
    /// Returns the reply length, or `None` when nothing should be sent.
    pub fn handle(&mut self, frame: &[u8], reply: &mut [u8], now: Instant) -> Option<usize> {
        let message = parse_dhcp_message(frame)?;

        let [.., mac_tail] = message.client_mac;
        debug!("DHCP {:?} from client ..{}", message.msg_type, mac_tail);
        self.expire_leases(now);

        if message.msg_type == DhcpMessageType::Request
            && message
                .server_id
                .is_some_and(|server_id| server_id != self.server_ip)
        {
            // The client picked another server.
            self.leases.retain(|lease| lease.mac != message.client_mac);
            return None;
        }

        if message.msg_type == DhcpMessageType::Request
            && message
                .requested_ip
                .is_some_and(|ip| !self.available_to(ip, message.client_mac))
        {
            // Asked for an address outside the pool or held by someone else.
            self.leases.retain(|lease| lease.mac != message.client_mac);
            return self.build_nak(reply, &message);
        }

        let offer_ip = match message.msg_type {
            DhcpMessageType::Discover | DhcpMessageType::Request => self.ensure_lease(
                message.client_mac,
                message.requested_ip.or(message.client_ip),
                now,
            )?,
            DhcpMessageType::Decline | DhcpMessageType::Release => {
                self.leases.retain(|lease| lease.mac != message.client_mac);
                return None;
            }
            DhcpMessageType::Inform | DhcpMessageType::Other(_) => return None,
        };

        self.build_reply(reply, &message, offer_ip)
    }

    fn build_reply(
        &self,
        scratch: &mut [u8],
        request: &DhcpMessage,
        offered_ip: Ipv4Addr,
    ) -> Option<usize> {
        write_header(scratch, request, offered_ip, self.server_ip)?;

        let server_bytes = self.server_ip.octets();
        let reply_kind = match request.msg_type {
            DhcpMessageType::Discover => DHCP_OFFER,
            _ => DHCP_ACK,
        };

        let mut idx = DHCP_MIN_FRAME;
        append_option(scratch, &mut idx, OPTION_MESSAGE_TYPE, &[reply_kind])?;
        append_option(scratch, &mut idx, OPTION_SERVER_ID, &server_bytes)?;
        append_option(scratch, &mut idx, OPTION_LEASE_TIME, &DHCP_LEASE_SECONDS.to_be_bytes())?;
        append_option(scratch, &mut idx, OPTION_RENEWAL_TIME, &DHCP_RENEWAL_SECONDS.to_be_bytes())?;
        append_option(
            scratch,
            &mut idx,
            OPTION_REBINDING_TIME,
            &DHCP_REBINDING_SECONDS.to_be_bytes(),
        )?;
        append_option(scratch, &mut idx, OPTION_SUBNET_MASK, &self.netmask.octets())?;
        append_option(scratch, &mut idx, OPTION_ROUTER, &server_bytes)?;
        append_option(scratch, &mut idx, OPTION_DNS_SERVER, &server_bytes)?;
        append_option(scratch, &mut idx, OPTION_BROADCAST, &self.broadcast_ip().octets())?;
        if !self.portal_uri.is_empty() {
            append_option(scratch, &mut idx, OPTION_CAPTIVE_PORTAL, self.portal_uri.as_bytes())?;
        }
        finish_reply(scratch, idx)
    }

    /// Refuse a REQUEST; the client restarts with DISCOVER.
    fn build_nak(&self, scratch: &mut [u8], request: &DhcpMessage) -> Option<usize> {
        write_header(scratch, request, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)?;
        let mut idx = DHCP_MIN_FRAME;
        append_option(scratch, &mut idx, OPTION_MESSAGE_TYPE, &[DHCP_NAK])?;
        append_option(scratch, &mut idx, OPTION_SERVER_ID, &self.server_ip.octets())?;
        finish_reply(scratch, idx)
    }

    fn in_pool(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip)
            .checked_sub(u32::from(self.pool_start))
            .is_some_and(|offset| offset < u32::from(POOL_SIZE))
    }

    /// In the pool and not leased to another client.
    fn available_to(&self, ip: Ipv4Addr, mac: [u8; 6]) -> bool {
        self.in_pool(ip)
            && self
                .leases
                .iter()
                .all(|lease| lease.mac == mac || lease.ip != ip)
    }

    fn expire_leases(&mut self, now: Instant) {
        self.leases.retain(|lease| lease.expires_at > now);
    }

    fn ensure_lease(
        &mut self,
        mac: [u8; 6],
        requested: Option<Ipv4Addr>,
        now: Instant,
    ) -> Option<Ipv4Addr> {
        let expiry = now
            .checked_add(Duration::from_secs(u64::from(DHCP_LEASE_SECONDS)))
            .unwrap_or(Instant::MAX);
        let desired_ip = requested.filter(|ip| self.available_to(*ip, mac));

        if let Some(existing) = self.leases.iter_mut().find(|lease| lease.mac == mac) {
            if let Some(ip) = desired_ip {
                existing.ip = ip;
            }
            existing.expires_at = expiry;
            return Some(existing.ip);
        }

        let base = u32::from(self.pool_start);
        let ip = desired_ip.or_else(|| {
            (0..u32::from(POOL_SIZE))
                .map(|offset| Ipv4Addr::from(base.saturating_add(offset)))
                .find(|candidate| self.leases.iter().all(|lease| lease.ip != *candidate))
        })?;

        self.leases
            .push(DhcpLease {
                mac,
                ip,
                expires_at: expiry,
            })
            .ok()?;
        let [.., host] = ip.octets();
        info!("DHCP leased .{} to client", host);
        Some(ip)
    }
}

fn write_header(
    scratch: &mut [u8],
    request: &DhcpMessage,
    your_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
) -> Option<()> {
    if scratch.len() < DHCP_MIN_REPLY {
        return None;
    }
    let header = scratch.get_mut(..DHCP_MIN_FRAME)?;
    header.fill(0);
    // BOOTREPLY
    put(header, 0, &[2, request.hardware_type, request.hardware_len])?;
    put(header, 4, &request.transaction_id.to_be_bytes())?;
    put(header, 10, &request.flags.to_be_bytes())?;
    put(header, 16, &your_ip.octets())?;
    put(header, 20, &server_ip.octets())?;
    put(header, 28, &request.client_mac)?;
    put(header, 236, &DHCP_MAGIC_COOKIE)
}

/// Terminate the options at `idx` and pad to the minimum BOOTP size some clients insist on.
fn finish_reply(scratch: &mut [u8], idx: usize) -> Option<usize> {
    *scratch.get_mut(idx)? = OPTION_END;
    let end = idx.checked_add(1)?;
    let len = end.max(DHCP_MIN_REPLY);
    scratch.get_mut(end..len)?.fill(0);
    Some(len)
}

#[cfg(feature = "wifi")]
mod wifi_impl {
    use core::net::Ipv4Addr;

    use embassy_executor::Spawner;
    use embassy_futures::select::{Either, select};
    use embassy_net::Stack;
    use embassy_net::udp::{PacketMetadata, UdpSocket};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_sync::signal::Signal;
    use embassy_time::Instant;

    use super::{DHCP_CLIENT_PORT, DHCP_FRAME_LEN, DHCP_SERVER_PORT, DhcpServer};
    use crate::{Error, Result};

    /// Shared handle that starts and stops the DHCP server task.
    pub struct DhcpService {
        shutdown: Signal<CriticalSectionRawMutex, ()>,
        ready: Signal<CriticalSectionRawMutex, Result<()>>,
    }

    impl Default for DhcpService {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DhcpService {
        /// Create an idle service.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                shutdown: Signal::new(),
                ready: Signal::new(),
            }
        }

        /// Bind port 67 and serve leases around `server_ip`.
        ///
        /// # Errors
        ///
        /// Returns [`Error::SocketBind`] or [`Error::TaskSpawn`].
        pub async fn start(
            &'static self,
            stack: Stack<'static>,
            spawner: Spawner,
            server_ip: Ipv4Addr,
            portal_uri: &str,
        ) -> Result<()> {
            self.shutdown.reset();
            self.ready.reset();
            let server = DhcpServer::new(server_ip, portal_uri);
            spawner.spawn(dhcp_server_task(stack, self, server)?);
            self.ready.wait().await
        }

        /// Ask the running task to close its socket and return.
        pub fn stop(&self) {
            self.shutdown.signal(());
        }
    }

    #[embassy_executor::task]
    async fn dhcp_server_task(
        stack: Stack<'static>,
        service: &'static DhcpService,
        mut server: DhcpServer,
    ) {
        let mut rx_meta = [PacketMetadata::EMPTY; 4];
        let mut rx_buffer = [0u8; DHCP_FRAME_LEN];
        let mut tx_meta = [PacketMetadata::EMPTY; 4];
        let mut tx_buffer = [0u8; DHCP_FRAME_LEN];
        let mut socket = UdpSocket::new(
            stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );

        if socket.bind(DHCP_SERVER_PORT).is_err() {
            error!("DHCP server failed to bind port {}", DHCP_SERVER_PORT);
            service.ready.signal(Err(Error::SocketBind(DHCP_SERVER_PORT)));
            return;
        }
        service.ready.signal(Ok(()));
        info!("DHCP server listening on port {}", DHCP_SERVER_PORT);

        let broadcast = server.broadcast_ip();
        let mut frame = [0u8; DHCP_FRAME_LEN];
        let mut response = [0u8; DHCP_FRAME_LEN];

        loop {
            let received = select(socket.recv_from(&mut frame), service.shutdown.wait()).await;
            let len = match received {
                Either::First(Ok((len, _remote))) => len,
                Either::First(Err(_)) => {
                    warn!("DHCP receive error");
                    continue;
                }
                Either::Second(()) => {
                    socket.close();
                    info!("DHCP server stopped");
                    return;
                }
            };

            let Some(request) = frame.get(..len) else {
                continue;
            };
            let Some(response_len) = server.handle(request, &mut response, Instant::now()) else {
                continue;
            };
            let Some(reply) = response.get(..response_len) else {
                continue;
            };
            if socket
                .send_to(reply, (broadcast, DHCP_CLIENT_PORT))
                .await
                .is_err()
            {
                warn!("DHCP send error");
            }
        }
    }
}

#[cfg(feature = "wifi")]
pub use wifi_impl::DhcpService;
