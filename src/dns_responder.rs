//! Captive-portal DNS responder.
//!
//! Answers every `A`/`IN` question with the access point's own address so that phones and
//! laptops open the configuration page no matter which host they look up. Nothing is ever
//! forwarded upstream.
//!
//! The rewrite happens in place inside one fixed 512-byte buffer: the original questions are
//! echoed back, answers are appended behind them, and any bytes after the question section
//! (EDNS records and the like) are shifted out.

#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::net::Ipv4Addr;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::Result;

/// Largest datagram handled, and the size of the reused packet buffer.
pub const DNS_MAX_LEN: usize = 512;
/// Standard DNS port.
pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const ANSWER_LEN: usize = 16;
const QUESTION_FIELDS_LEN: usize = 4;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const POINTER_TAG: u8 = 0xC0;

const FLAGS_OFFSET: usize = 2;
const QDCOUNT_OFFSET: usize = 4;
const ANCOUNT_OFFSET: usize = 6;
const NSCOUNT_OFFSET: usize = 8;
const ARCOUNT_OFFSET: usize = 10;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_OPCODE: u16 = 0x7800;
const FLAG_TRUNCATED: u16 = 0x0200;
const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Rewrite the query in `buffer[..len]` into a reply and return the reply length.
///
/// Returns `None` when the datagram must be dropped without a reply: shorter than a header,
/// not a standard query, or a question whose name cannot be walked.
#[must_use]
pub fn answer_queries(
    buffer: &mut [u8; DNS_MAX_LEN],
    len: usize,
    address: Ipv4Addr,
) -> Option<usize> {
    let mut message = DnsMessage::new(buffer, len)?;

    let flags = message.header(FLAGS_OFFSET);
    if flags & (FLAG_RESPONSE | FLAG_OPCODE) != 0 {
        return None;
    }

    let question_count = message.header(QDCOUNT_OFFSET);
    let mut cursor = HEADER_LEN;
    let mut answers: u16 = 0;
    for _ in 0..question_count {
        let question = message.question_at(cursor)?;
        if question.is_internet_address() && message.append_answer(&question, address) {
            answers = answers.saturating_add(1);
        }
        cursor = question.end;
    }

    message.drop_trailing_query_bytes(cursor);
    message.set_header(
        FLAGS_OFFSET,
        (flags | FLAG_RESPONSE | FLAG_RECURSION_AVAILABLE) & !FLAG_TRUNCATED,
    );
    message.set_header(ANCOUNT_OFFSET, answers);
    message.set_header(NSCOUNT_OFFSET, 0);
    message.set_header(ARCOUNT_OFFSET, 0);
    Some(message.len())
}

/// One datagram inside the shared buffer.
///
/// `query_len` bytes were received; `len` grows as answers are appended and never exceeds
/// [`DNS_MAX_LEN`].
struct DnsMessage<'a> {
    buffer: &'a mut [u8; DNS_MAX_LEN],
    query_len: usize,
    len: usize,
}

/// A parsed question: where its (possibly indirect) name lives and where the question ends.
struct Question {
    name_offset: usize,
    type_and_class: [u8; QUESTION_FIELDS_LEN],
    end: usize,
}

impl Question {
    fn is_internet_address(&self) -> bool {
        let [type_hi, type_lo, class_hi, class_lo] = self.type_and_class;
        u16::from_be_bytes([type_hi, type_lo]) == TYPE_A
            && u16::from_be_bytes([class_hi, class_lo]) == CLASS_IN
    }
}

impl<'a> DnsMessage<'a> {
    fn new(buffer: &'a mut [u8; DNS_MAX_LEN], len: usize) -> Option<Self> {
        if !(HEADER_LEN..=DNS_MAX_LEN).contains(&len) {
            return None;
        }
        Some(Self {
            buffer,
            query_len: len,
            len,
        })
    }

    const fn len(&self) -> usize {
        self.len
    }

    fn query(&self) -> &[u8] {
        self.buffer.get(..self.query_len).unwrap_or_default()
    }

    fn header(&self, offset: usize) -> u16 {
        match self.buffer.get(offset..offset.saturating_add(2)) {
            Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
            _ => 0,
        }
    }

    fn set_header(&mut self, offset: usize, value: u16) {
        if let Some(field) = self.buffer.get_mut(offset..offset.saturating_add(2)) {
            field.copy_from_slice(&value.to_be_bytes());
        }
    }

    /// Parse the question starting at `start`, following at most one compression pointer.
    fn question_at(&self, start: usize) -> Option<Question> {
        let query = self.query();
        let first = *query.get(start)?;
        let (name_offset, name_end) = if first & POINTER_TAG == POINTER_TAG {
            let second = *query.get(start.checked_add(1)?)?;
            let target = usize::from(u16::from_be_bytes([first & !POINTER_TAG, second]));
            if target >= query.len() {
                return None;
            }
            encoded_name_len(query, target)?;
            (target, start.checked_add(2)?)
        } else {
            (start, start.checked_add(encoded_name_len(query, start)?)?)
        };

        let end = name_end.checked_add(QUESTION_FIELDS_LEN)?;
        let type_and_class = query.get(name_end..end)?.try_into().ok()?;
        Some(Question {
            name_offset,
            type_and_class,
            end,
        })
    }

    /// Append an answer for `question`; `false` when it would not fit.
    fn append_answer(&mut self, question: &Question, address: Ipv4Addr) -> bool {
        let Ok(pointer) = u16::try_from(question.name_offset) else {
            return false;
        };
        let [name_hi, name_lo] = (pointer | u16::from_be_bytes([POINTER_TAG, 0])).to_be_bytes();
        let [type_hi, type_lo, class_hi, class_lo] = question.type_and_class;
        let [len_hi, len_lo] = 4u16.to_be_bytes();
        let [a, b, c, d] = address.octets();
        // TTL stays zero so clients do not cache the spoofed address.
        let answer: [u8; ANSWER_LEN] = [
            name_hi, name_lo, type_hi, type_lo, class_hi, class_lo, 0, 0, 0, 0, len_hi, len_lo, a,
            b, c, d,
        ];
        self.append(&answer)
    }

    fn append(&mut self, bytes: &[u8]) -> bool {
        let Some(end) = self.len.checked_add(bytes.len()) else {
            return false;
        };
        let Some(slot) = self.buffer.get_mut(self.len..end) else {
            return false;
        };
        slot.copy_from_slice(bytes);
        self.len = end;
        true
    }

    /// Move the answers down so they directly follow the last parsed question.
    fn drop_trailing_query_bytes(&mut self, question_end: usize) {
        let Some(excess) = self.query_len.checked_sub(question_end).filter(|&n| n > 0) else {
            return;
        };
        self.buffer
            .copy_within(self.query_len..self.len, question_end);
        self.len = self.len.saturating_sub(excess);
        self.query_len = question_end;
    }
}

/// Length of the label sequence at `start`, including its terminating zero byte.
///
/// Compression pointers are rejected here: they are only valid as the first byte of a question.
fn encoded_name_len(message: &[u8], start: usize) -> Option<usize> {
    let mut offset = start;
    loop {
        let label_len = usize::from(*message.get(offset)?);
        if label_len == 0 {
            let total = offset.checked_add(1)?.checked_sub(start)?;
            return (total <= MAX_NAME_LEN).then_some(total);
        }
        if label_len > MAX_LABEL_LEN {
            return None;
        }
        offset = offset.checked_add(1)?.checked_add(label_len)?;
        if offset >= message.len() || offset.checked_sub(start)? >= MAX_NAME_LEN {
            return None;
        }
    }
}

/// The datagram endpoint the responder reads from and replies on.
#[allow(async_fn_in_trait, reason = "single-threaded executor")]
pub trait DatagramSocket {
    /// Address of the peer a datagram came from.
    type Endpoint;

    /// Wait for the next datagram.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Socket`] once the socket is closed.
    async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, Self::Endpoint)>;

    /// Send one datagram back to `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Socket`] if the datagram could not be queued.
    async fn send_to(&mut self, datagram: &[u8], remote: Self::Endpoint) -> Result<()>;

    /// Close the socket; later receives fail.
    fn close(&mut self);
}

/// Shared handle that starts and stops the responder loop.
///
/// Construct as a `static` with [`DnsResponder::new`]; the loop itself runs in a dedicated
/// task (see [`DnsResponder::serve`]).
pub struct DnsResponder {
    shutdown: Signal<CriticalSectionRawMutex, ()>,
    #[cfg(feature = "wifi")]
    ready: Signal<CriticalSectionRawMutex, Result<()>>,
}

impl Default for DnsResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResponder {
    /// Create an idle responder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shutdown: Signal::new(),
            #[cfg(feature = "wifi")]
            ready: Signal::new(),
        }
    }

    /// Ask a running loop to close its socket and return.
    pub fn stop(&self) {
        self.shutdown.signal(());
    }

    /// Answer datagrams on `socket` until it closes or [`Self::stop`] is called.
    ///
    /// Only one datagram is in flight at a time and the packet buffer never outlives an
    /// iteration. Receive errors mean the socket is gone, which is the normal way out.
    pub async fn serve<S: DatagramSocket>(&self, socket: &mut S, address: Ipv4Addr) {
        let mut buffer = [0u8; DNS_MAX_LEN];
        loop {
            let received = select(socket.recv_from(&mut buffer), self.shutdown.wait()).await;
            let (len, remote) = match received {
                Either::First(Ok(datagram)) => datagram,
                Either::First(Err(_)) => {
                    info!("DNS responder socket closed");
                    return;
                }
                Either::Second(()) => {
                    socket.close();
                    info!("DNS responder stopped");
                    return;
                }
            };

            let Some(reply_len) = answer_queries(&mut buffer, len, address) else {
                debug!("DNS: dropped {} byte datagram", len);
                continue;
            };
            let Some(reply) = buffer.get(..reply_len) else {
                continue;
            };
            if let Err(err) = socket.send_to(reply, remote).await {
                warn!("DNS send error: {}", err);
            }
        }
    }
}

#[cfg(feature = "wifi")]
mod wifi_impl {
    use core::net::Ipv4Addr;

    use embassy_executor::Spawner;
    use embassy_net::Stack;
    use embassy_net::udp::{PacketMetadata, UdpMetadata, UdpSocket};

    use super::{DNS_MAX_LEN, DNS_PORT, DatagramSocket, DnsResponder};
    use crate::{Error, Result};

    impl DatagramSocket for UdpSocket<'_> {
        type Endpoint = UdpMetadata;

        async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, UdpMetadata)> {
            UdpSocket::recv_from(self, buffer)
                .await
                .map_err(|_| Error::Socket)
        }

        async fn send_to(&mut self, datagram: &[u8], remote: UdpMetadata) -> Result<()> {
            UdpSocket::send_to(self, datagram, remote)
                .await
                .map_err(|_| Error::Socket)
        }

        fn close(&mut self) {
            UdpSocket::close(self);
        }
    }

    impl DnsResponder {
        /// Bind port 53 on `stack` and spawn the responder loop.
        ///
        /// # Errors
        ///
        /// Returns [`Error::SocketBind`] if the port cannot be bound, or
        /// [`Error::TaskSpawn`] if the task is already running.
        pub async fn start(
            &'static self,
            stack: Stack<'static>,
            spawner: Spawner,
            address: Ipv4Addr,
        ) -> Result<()> {
            self.shutdown.reset();
            self.ready.reset();
            spawner.spawn(dns_responder_task(stack, self, address)?);
            self.ready.wait().await
        }
    }

    #[embassy_executor::task]
    async fn dns_responder_task(
        stack: Stack<'static>,
        responder: &'static DnsResponder,
        address: Ipv4Addr,
    ) {
        let mut rx_meta = [PacketMetadata::EMPTY; 4];
        let mut rx_buffer = [0u8; DNS_MAX_LEN];
        let mut tx_meta = [PacketMetadata::EMPTY; 4];
        let mut tx_buffer = [0u8; DNS_MAX_LEN];
        let mut socket = UdpSocket::new(
            stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );

        if socket.bind(DNS_PORT).is_err() {
            error!("DNS responder failed to bind port {}", DNS_PORT);
            responder.ready.signal(Err(Error::SocketBind(DNS_PORT)));
            return;
        }
        responder.ready.signal(Ok(()));
        info!("DNS responder listening on port {}", DNS_PORT);

        responder.serve(&mut socket, address).await;
    }
}
