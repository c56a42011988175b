//! Captive-portal HTTP responder.
//!
//! [`Portal`] turns one raw HTTP request into one raw HTTP response without touching the
//! network, so the routing is testable on the host. The TCP task that feeds it lives behind
//! feature `wifi`.

#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::fmt::Write;
use core::net::Ipv4Addr;

use heapless::String;

use crate::credentials::{CredentialForm, Credentials};

/// HTTP port the portal listens on.
pub const HTTP_PORT: u16 = 80;
/// Largest POST body the portal accepts.
pub const MAX_BODY_LEN: usize = 4096;
/// Longest portal URL, `http://255.255.255.255`.
pub const PORTAL_URL_MAX_LEN: usize = 32;
/// Capacity of one rendered response.
pub const RESPONSE_CAPACITY: usize = 4096;

/// Root URL of the portal, e.g. `http://192.168.4.1`.
pub type PortalUrl = String<PORTAL_URL_MAX_LEN>;
/// One rendered HTTP response, status line included.
pub type HtmlBuffer = String<RESPONSE_CAPACITY>;

/// The URL clients are redirected to for an access point at `address`.
#[must_use]
pub fn portal_url(address: Ipv4Addr) -> PortalUrl {
    let [a, b, c, d] = address.octets();
    let mut url = PortalUrl::new();
    // Fits: at most 22 bytes.
    let _ = write!(url, "http://{a}.{b}.{c}.{d}");
    url
}

/// The parts of an HTTP request the portal routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    /// Method token, e.g. `GET`.
    pub method: &'a str,
    /// Request target without its query string.
    pub path: &'a str,
    /// Declared body length; `0` when absent or unparsable.
    pub content_length: usize,
    /// Bytes after the header block, possibly fewer than `content_length`.
    pub body: &'a [u8],
    /// Whether the `\r\n\r\n` header terminator was seen.
    pub head_complete: bool,
}

impl<'a> Request<'a> {
    /// The declared body, or `None` while the head or any body byte is still missing.
    #[must_use]
    pub fn complete_body(&self) -> Option<&'a [u8]> {
        if !self.head_complete {
            return None;
        }
        self.body.get(..self.content_length)
    }
}

/// Offset just past the `\r\n\r\n` header terminator, if the head is complete.
#[must_use]
pub fn header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at.saturating_add(4))
}

/// Split a raw request into request line, headers and body.
///
/// Returns `None` when the request line is missing or not UTF-8.
#[must_use]
pub fn parse_request(raw: &[u8]) -> Option<Request<'_>> {
    let (head, body, head_complete) = match header_end(raw) {
        Some(end) => {
            let (head, body) = raw.split_at(end);
            (head, body, true)
        }
        None => (raw, &[][..], false),
    };
    let head = core::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let path = target.split_once('?').map_or(target, |(path, _query)| path);

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    Some(Request {
        method,
        path,
        content_length,
        body,
        head_complete,
    })
}

/// Routes requests while the access point is up.
pub struct Portal {
    url: PortalUrl,
    defaults: Credentials,
}

impl Portal {
    /// Serve the form prefilled from `defaults` and redirect strays to `url`.
    #[must_use]
    pub fn new(url: &str, defaults: Credentials) -> Self {
        let mut portal_url = PortalUrl::new();
        for ch in url.chars() {
            if portal_url.push(ch).is_err() {
                break;
            }
        }
        Self {
            url: portal_url,
            defaults,
        }
    }

    /// Answer `raw` into `response`.
    ///
    /// Returns the submitted credentials when the request was a form submission; the caller
    /// forwards them to the coordinator.
    pub fn respond(&self, raw: &[u8], response: &mut HtmlBuffer) -> Option<Credentials> {
        response.clear();
        let Some(request) = parse_request(raw) else {
            warn!("Portal: malformed request");
            self.redirect(response);
            return None;
        };

        match (request.method, request.path) {
            ("GET", "/") => {
                self.config_page(response);
                None
            }
            ("POST", "/") if request.content_length > MAX_BODY_LEN => {
                warn!(
                    "Portal: rejecting {} byte form body",
                    request.content_length
                );
                plain(response, "500 Internal Server Error", "content too long");
                None
            }
            ("POST", "/") => {
                let Some(body) = request.complete_body() else {
                    warn!(
                        "Portal: form body incomplete, {} of {} bytes",
                        request.body.len(),
                        request.content_length
                    );
                    plain(response, "500 Internal Server Error", "Failed to post control value");
                    return None;
                };
                let mut form = CredentialForm::prefilled(&self.defaults);
                form.parse(body);
                let submitted = form.apply(&self.defaults);
                info!("Portal: setup submitted");
                plain(response, "200 OK", "Setup completed");
                Some(submitted)
            }
            _ => {
                self.redirect(response);
                None
            }
        }
    }

    fn redirect(&self, response: &mut HtmlBuffer) {
        let _ = write!(
            response,
            "HTTP/1.1 302 Temporary Redirect\r\n\
             Location: {}\r\n\
             Content-Type: text/html\r\n\
             Content-Length: 5\r\n\
             Connection: close\r\n\
             \r\n\
             setup",
            self.url
        );
    }

    fn config_page(&self, response: &mut HtmlBuffer) {
        let ssid = escape_html::<160>(&self.defaults.ssid);
        let timezone = escape_html::<320>(&self.defaults.timezone);
        let rendered = write!(
            response,
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/html\r\n\
             Connection: close\r\n\
             \r\n\
             <!DOCTYPE html>\
             <html>\
             <head>\
                 <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
                 <title>Alarm Clock Setup</title>\
                 <link rel=\"icon\" href=\"data:,\">\
                 <style>\
                     body {{ font-family: Arial, sans-serif; max-width: 500px; margin: 50px auto; padding: 20px; }}\
                     input {{ width: 100%; padding: 10px; margin: 10px 0; box-sizing: border-box; }}\
                     label {{ display: block; margin-top: 10px; }}\
                     button {{ width: 100%; padding: 12px; background-color: #4CAF50; color: white; border: none; }}\
                 </style>\
             </head>\
             <body>\
                 <h1>Alarm Clock Setup</h1>\
                 <form method=\"POST\" action=\"/\">\
                    <label for=\"ssid\">WiFi Network Name (SSID):</label>\
                    <input type=\"text\" id=\"ssid\" name=\"ssid\" maxlength=\"32\" value=\"{ssid}\" required>\
                    <label for=\"password\">Password:</label>\
                    <input type=\"password\" id=\"password\" name=\"password\" maxlength=\"63\">\
                    <label for=\"timezone\">Timezone (POSIX TZ, e.g. CET-1CEST,M3.5.0,M10.5.0/3):</label>\
                    <input type=\"text\" id=\"timezone\" name=\"timezone\" maxlength=\"63\" value=\"{timezone}\">\
                    <button type=\"submit\">Save</button>\
                 </form>\
             </body>\
             </html>"
        );
        if rendered.is_err() {
            warn!("Portal: configuration page truncated");
        }
    }
}

fn plain(response: &mut HtmlBuffer, status: &str, body: &str) {
    let _ = write!(
        response,
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
}

/// Escape the five HTML-significant characters; output is cut at `N` bytes.
#[must_use]
pub fn escape_html<const N: usize>(value: &str) -> String<N> {
    let mut escaped = String::<N>::new();
    for ch in value.chars() {
        let pushed = match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        };
        if pushed.is_err() {
            break;
        }
    }
    escaped
}

#[cfg(feature = "wifi")]
mod wifi_impl {
    use embassy_executor::Spawner;
    use embassy_futures::select::{Either, select};
    use embassy_net::Stack;
    use embassy_net::tcp::TcpSocket;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_sync::signal::Signal;
    use embassy_time::{Duration, Timer};
    use embedded_io_async::Write as _;

    use super::{HTTP_PORT, HtmlBuffer, MAX_BODY_LEN, Portal, header_end, parse_request};
    use crate::Result;
    use crate::credentials::Credentials;

    const HEAD_CAPACITY: usize = 1024;
    const REQUEST_CAPACITY: usize = HEAD_CAPACITY + MAX_BODY_LEN;

    /// Shared handle that starts and stops the HTTP portal task.
    pub struct HttpPortal {
        shutdown: Signal<CriticalSectionRawMutex, ()>,
    }

    impl Default for HttpPortal {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HttpPortal {
        /// Create an idle portal.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                shutdown: Signal::new(),
            }
        }

        /// Serve `portal` on port 80 until [`HttpPortal::stop`].
        ///
        /// Submitted credentials are signalled on `submissions`.
        ///
        /// # Errors
        ///
        /// Returns [`Error::TaskSpawn`](crate::Error::TaskSpawn) when the task is still running.
        pub fn start(
            &'static self,
            stack: Stack<'static>,
            spawner: Spawner,
            portal: Portal,
            submissions: &'static Signal<CriticalSectionRawMutex, Credentials>,
        ) -> Result<()> {
            self.shutdown.reset();
            spawner.spawn(http_portal_task(stack, self, portal, submissions)?);
            Ok(())
        }

        /// Ask the running task to close its socket and return.
        pub fn stop(&self) {
            self.shutdown.signal(());
        }
    }

    #[embassy_executor::task]
    async fn http_portal_task(
        stack: Stack<'static>,
        service: &'static HttpPortal,
        portal: Portal,
        submissions: &'static Signal<CriticalSectionRawMutex, Credentials>,
    ) {
        info!("HTTP portal starting");
        let mut rx_buffer = [0u8; 2048];
        let mut tx_buffer = [0u8; 2048];
        let mut request = [0u8; REQUEST_CAPACITY];
        let mut response = HtmlBuffer::new();

        loop {
            let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
            socket.set_timeout(Some(Duration::from_secs(30)));

            match select(socket.accept(HTTP_PORT), service.shutdown.wait()).await {
                Either::First(Ok(())) => {}
                Either::First(Err(_)) => {
                    warn!("HTTP accept error");
                    Timer::after_millis(500).await;
                    continue;
                }
                Either::Second(()) => {
                    socket.abort();
                    info!("HTTP portal stopped");
                    return;
                }
            }

            let request_len =
                match select(read_request(&mut socket, &mut request), service.shutdown.wait())
                    .await
                {
                    Either::First(Some(len)) => len,
                    Either::First(None) => {
                        socket.close();
                        continue;
                    }
                    Either::Second(()) => {
                        socket.abort();
                        info!("HTTP portal stopped");
                        return;
                    }
                };

            let raw = request.get(..request_len).unwrap_or_default();
            if let Some(credentials) = portal.respond(raw, &mut response) {
                submissions.signal(credentials);
            }

            if socket.write_all(response.as_bytes()).await.is_err() {
                warn!("HTTP write error");
            }
            let _ = socket.flush().await;
            socket.close();
            Timer::after_millis(100).await;
        }
    }

    /// Read the head, then as much of the body as `Content-Length` announces.
    ///
    /// An oversized body is not read; the portal rejects it from the head alone. A request
    /// cut short by the peer or too big for the buffer yields `None`, never a partial one.
    async fn read_request(socket: &mut TcpSocket<'_>, request: &mut [u8]) -> Option<usize> {
        let mut filled = 0usize;
        let mut wanted: Option<usize> = None;
        loop {
            if wanted.is_some_and(|total| filled >= total) {
                return Some(filled);
            }
            let free = request.get_mut(filled..)?;
            if free.is_empty() {
                warn!("HTTP request exceeds {} bytes", REQUEST_CAPACITY);
                return None;
            }
            match socket.read(free).await {
                Ok(0) => {
                    if filled > 0 {
                        warn!("HTTP peer closed mid-request after {} bytes", filled);
                    }
                    return None;
                }
                Ok(read) => filled = filled.saturating_add(read),
                Err(_) => {
                    warn!("HTTP read error");
                    return None;
                }
            }
            if wanted.is_none() {
                let head = request.get(..filled)?;
                if let Some(end) = header_end(head) {
                    let length = parse_request(head).map_or(0, |parsed| parsed.content_length);
                    wanted = Some(if length > MAX_BODY_LEN {
                        end
                    } else {
                        end.saturating_add(length)
                    });
                } else if filled >= HEAD_CAPACITY {
                    warn!("HTTP request head exceeds {} bytes", HEAD_CAPACITY);
                    return None;
                }
            }
        }
    }
}

#[cfg(feature = "wifi")]
pub use wifi_impl::HttpPortal;
