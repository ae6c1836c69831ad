//! HTTP/1.1 client
//!
//! Non-blocking request state machine keyed off a TCP connection:
//! `idle -> dns -> connecting -> headers -> body -> done`, with `error` as
//! the terminal failure state. Plain `http://` only - TLS is rejected at
//! URL parse time.

use core::fmt::Write;

use super::dns::DnsQueryState;
use super::tcp::TcpState;
use super::{Ipv4Addr, NetDevice, NetStack};

pub const HTTP_MAX_HOST: usize = 64;
pub const HTTP_MAX_PATH: usize = 128;
pub const HTTP_MAX_HEADERS: usize = 512;
pub const HTTP_MAX_BODY: usize = 4096;
const HTTP_MAX_REQ_BODY: usize = 1024;

/// Poll budget for the blocking helpers
const BLOCKING_POLL_BUDGET: u32 = 50_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpState {
    Idle,
    Dns,
    Connecting,
    Headers,
    Body,
    Done,
    Error,
}

// ═══════════════════════════════════════════════════════════════════════════════
// URL
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Url {
    pub host: heapless::String<HTTP_MAX_HOST>,
    pub path: heapless::String<HTTP_MAX_PATH>,
    pub port: u16,
    pub is_https: bool,
}

/// Parse `http://host[:port]/path`. `https://` parses but is flagged so the
/// caller can reject it as unsupported.
pub fn parse_url(url: &str) -> Result<Url, &'static str> {
    let mut rest = url;
    let mut port = 80u16;
    let mut is_https = false;

    if let Some(r) = rest.strip_prefix("https://") {
        is_https = true;
        port = 443;
        rest = r;
    } else if let Some(r) = rest.strip_prefix("http://") {
        rest = r;
    }

    let (host_part, path_part) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let (host_str, port_str) = match host_part.find(':') {
        Some(i) => (&host_part[..i], Some(&host_part[i + 1..])),
        None => (host_part, None),
    };

    if host_str.is_empty() {
        return Err("no host in URL");
    }

    if let Some(p) = port_str {
        port = 0;
        for c in p.bytes() {
            if !c.is_ascii_digit() {
                break;
            }
            port = port.wrapping_mul(10).wrapping_add((c - b'0') as u16);
        }
    }

    let mut host = heapless::String::new();
    host.push_str(host_str).map_err(|_| "host too long")?;
    let mut path = heapless::String::new();
    path.push_str(path_part).map_err(|_| "path too long")?;

    Ok(Url {
        host,
        path,
        port,
        is_https,
    })
}

/// All-digits-and-dots hosts short-circuit DNS
pub fn parse_ip_literal(host: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in host.split('.') {
        if count >= 4 || part.is_empty() || part.len() > 3 {
            return None;
        }
        let mut value: u32 = 0;
        for c in part.bytes() {
            if !c.is_ascii_digit() {
                return None;
            }
            value = value * 10 + (c - b'0') as u32;
        }
        if value > 255 {
            return None;
        }
        octets[count] = value as u8;
        count += 1;
    }
    if count != 4 {
        return None;
    }
    Some(Ipv4Addr(octets))
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESPONSE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct HttpResponse {
    pub status_code: u16,
    pub headers: heapless::String<HTTP_MAX_HEADERS>,
    pub body: heapless::Vec<u8, HTTP_MAX_BODY>,
    /// From Content-Length; -1 when unknown
    pub content_length: i32,
    pub chunked: bool,
}

impl HttpResponse {
    pub fn new() -> Self {
        HttpResponse {
            status_code: 0,
            headers: heapless::String::new(),
            body: heapless::Vec::new(),
            content_length: -1,
            chunked: false,
        }
    }

    pub fn body_str(&self) -> &str {
        core::str::from_utf8(&self.body).unwrap_or("")
    }
}

fn ascii_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// Find `\r\n\r\n`; returns the offset just past it
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse status line and the headers we care about out of a complete header
/// block. Returns `(status, content_length, chunked)`.
pub fn parse_header_block(head: &[u8]) -> (u16, i32, bool) {
    let mut status = 0u16;
    let mut content_length = -1i32;
    let mut chunked = false;

    let mut lines = head.split(|&b| b == b'\n');

    if let Some(status_line) = lines.next() {
        // Skip "HTTP/1.x ", then decimal code
        let mut it = status_line.splitn(3, |&b| b == b' ');
        let _version = it.next();
        if let Some(code) = it.next() {
            for &c in code {
                if c.is_ascii_digit() {
                    status = status.wrapping_mul(10).wrapping_add((c - b'0') as u16);
                } else {
                    break;
                }
            }
        }
    }

    for line in lines {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        let colon = match line.iter().position(|&b| b == b':') {
            Some(i) => i,
            None => continue,
        };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }

        if ascii_eq_ignore_case(name, b"content-length") {
            let mut len = 0i32;
            for &c in value {
                if c.is_ascii_digit() {
                    len = len.wrapping_mul(10).wrapping_add((c - b'0') as i32);
                } else {
                    break;
                }
            }
            content_length = len;
        } else if ascii_eq_ignore_case(name, b"transfer-encoding")
            && value.len() >= 7
            && ascii_eq_ignore_case(&value[..7], b"chunked")
        {
            chunked = true;
        }
    }

    (status, content_length, chunked)
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST
// ═══════════════════════════════════════════════════════════════════════════════

pub struct HttpRequest {
    state: HttpState,
    method: Method,
    url: Url,
    tcp_conn: Option<usize>,
    resolved_ip: Ipv4Addr,
    request_body: heapless::Vec<u8, HTTP_MAX_REQ_BODY>,
    pub response: HttpResponse,
    header_complete: bool,
}

impl HttpRequest {
    /// Begin a request. Hostnames start async DNS; IP literals connect
    /// immediately.
    pub fn start(
        stack: &mut NetStack,
        dev: &mut dyn NetDevice,
        method: Method,
        url: &str,
        body: &[u8],
    ) -> Result<HttpRequest, &'static str> {
        let url = parse_url(url)?;
        if url.is_https {
            return Err("https not supported");
        }
        if body.len() > HTTP_MAX_REQ_BODY {
            return Err("request body too large");
        }

        let mut request_body = heapless::Vec::new();
        let _ = request_body.extend_from_slice(body);

        let mut req = HttpRequest {
            state: HttpState::Idle,
            method,
            url,
            tcp_conn: None,
            resolved_ip: Ipv4Addr::UNSPECIFIED,
            request_body,
            response: HttpResponse::new(),
            header_complete: false,
        };

        if let Some(ip) = parse_ip_literal(req.url.host.as_str()) {
            req.resolved_ip = ip;
            let conn = stack.tcp_connect(dev, ip, req.url.port)?;
            req.tcp_conn = Some(conn);
            req.state = HttpState::Connecting;
        } else {
            stack.dns_start(dev, req.url.host.as_str());
            req.state = HttpState::Dns;
        }

        Ok(req)
    }

    pub fn state(&self) -> HttpState {
        self.state
    }

    fn send_request(&mut self, stack: &mut NetStack, dev: &mut dyn NetDevice) {
        let conn = match self.tcp_conn {
            Some(c) => c,
            None => return,
        };

        let mut head: heapless::String<1536> = heapless::String::new();
        let _ = write!(
            head,
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: TinyOS/1.0\r\nConnection: close\r\n",
            self.method.as_str(),
            self.url.path.as_str(),
            self.url.host.as_str()
        );
        if !self.request_body.is_empty() {
            let _ = write!(
                head,
                "Content-Type: text/plain\r\nContent-Length: {}\r\n",
                self.request_body.len()
            );
        }
        let _ = head.push_str("\r\n");

        let _ = stack.tcp_send(dev, conn, head.as_bytes());
        if !self.request_body.is_empty() {
            let mut body = heapless::Vec::<u8, HTTP_MAX_REQ_BODY>::new();
            let _ = body.extend_from_slice(&self.request_body);
            let _ = stack.tcp_send(dev, conn, &body);
        }
    }

    fn consume_rx(&mut self, stack: &mut NetStack, conn: usize) {
        let mut buf = [0u8; 1024];
        loop {
            let len = stack.tcp_recv(conn, &mut buf);
            if len == 0 {
                break;
            }

            if !self.header_complete {
                // Accumulate raw bytes in the body buffer until the header
                // terminator shows up, then split.
                let _ = self.response.body.extend_from_slice(&buf[..len]);
                if let Some(body_start) = find_header_end(&self.response.body) {
                    self.header_complete = true;

                    let (status, content_length, chunked) =
                        parse_header_block(&self.response.body[..body_start - 4]);
                    self.response.status_code = status;
                    self.response.content_length = content_length;
                    self.response.chunked = chunked;

                    let head_len = (body_start - 4).min(HTTP_MAX_HEADERS - 1);
                    if let Ok(head) = core::str::from_utf8(&self.response.body[..head_len]) {
                        let _ = self.response.headers.push_str(head);
                    }

                    // Bytes past the terminator are the body prefix
                    let mut rest: heapless::Vec<u8, HTTP_MAX_BODY> = heapless::Vec::new();
                    let _ = rest.extend_from_slice(&self.response.body[body_start..]);
                    self.response.body = rest;
                    self.state = HttpState::Body;
                }
            } else {
                let _ = self.response.body.extend_from_slice(&buf[..len]);
            }
        }
    }

    /// Advance the request. Call once per main-loop iteration.
    pub fn poll(&mut self, stack: &mut NetStack, dev: &mut dyn NetDevice) -> HttpState {
        match self.state {
            HttpState::Done | HttpState::Error | HttpState::Idle => return self.state,
            HttpState::Dns => {
                match stack.dns_poll(dev) {
                    DnsQueryState::Done => {
                        let ip = stack.dns_result().unwrap_or(Ipv4Addr::UNSPECIFIED);
                        self.resolved_ip = ip;
                        match stack.tcp_connect(dev, ip, self.url.port) {
                            Ok(conn) => {
                                self.tcp_conn = Some(conn);
                                self.state = HttpState::Connecting;
                            }
                            Err(_) => self.state = HttpState::Error,
                        }
                    }
                    DnsQueryState::Error => self.state = HttpState::Error,
                    _ => {}
                }
                return self.state;
            }
            _ => {}
        }

        let conn = match self.tcp_conn {
            Some(c) => c,
            None => {
                self.state = HttpState::Error;
                return self.state;
            }
        };
        let tcp_state = stack.tcp_state(conn);

        match self.state {
            HttpState::Connecting => match tcp_state {
                TcpState::Established => {
                    self.send_request(stack, dev);
                    self.state = HttpState::Headers;
                }
                TcpState::Closed => self.state = HttpState::Error,
                _ => {}
            },
            HttpState::Headers | HttpState::Body => {
                if stack.tcp_data_available(conn) {
                    self.consume_rx(stack, conn);
                }

                let remote_closed = matches!(
                    tcp_state,
                    TcpState::Closed | TcpState::CloseWait | TcpState::LastAck
                );
                if remote_closed {
                    self.state = HttpState::Done;
                } else if self.response.content_length >= 0
                    && self.header_complete
                    && self.response.body.len() >= self.response.content_length as usize
                {
                    self.state = HttpState::Done;
                    stack.tcp_close(dev, conn);
                }
            }
            _ => {}
        }

        self.state
    }

    /// Drop the TCP connection and reset to idle
    pub fn close(&mut self, stack: &mut NetStack, dev: &mut dyn NetDevice) {
        if let Some(conn) = self.tcp_conn.take() {
            stack.tcp_close(dev, conn);
        }
        self.state = HttpState::Idle;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCKING HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Blocking GET: polls the stack until done or the tick budget expires.
pub fn http_get(
    stack: &mut NetStack,
    dev: &mut dyn NetDevice,
    url: &str,
) -> Result<HttpRequest, &'static str> {
    http_blocking(stack, dev, Method::Get, url, &[])
}

/// Blocking POST with a body
pub fn http_post(
    stack: &mut NetStack,
    dev: &mut dyn NetDevice,
    url: &str,
    body: &[u8],
) -> Result<HttpRequest, &'static str> {
    http_blocking(stack, dev, Method::Post, url, body)
}

fn http_blocking(
    stack: &mut NetStack,
    dev: &mut dyn NetDevice,
    method: Method,
    url: &str,
    body: &[u8],
) -> Result<HttpRequest, &'static str> {
    let mut req = HttpRequest::start(stack, dev, method, url, body)?;

    for _ in 0..BLOCKING_POLL_BUDGET {
        stack.poll(dev);
        match req.poll(stack, dev) {
            HttpState::Done => return Ok(req),
            HttpState::Error => return Err("HTTP request failed"),
            _ => {}
        }
    }

    req.close(stack, dev);
    Err("HTTP request timed out")
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
