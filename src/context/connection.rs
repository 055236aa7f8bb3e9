//! Per-connection request context
//!
//! `ConnectionContext` wraps a realtime [`Socket`] and gives handlers the
//! accessors they would expect from an HTTP request context: headers, url and
//! query, proxy-aware host/protocol/ip, and a cookie jar. Socket state is never
//! copied; every forwarded member reads or acts on the socket directly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, REFERER};
use mime::Mime;
use serde_json::Value;
use tracing::debug;

use super::{Cookies, NoopResponse, Query};
use crate::transport::{
    Adapter, AckCallback, BroadcastOperator, Client, Conn, Flags, Handshake, HandshakeRequest,
    Namespace, Server, Socket, TransportResult,
};

/// Build a context for `client` in `nsp`.
///
/// Same as [`ConnectionContext::new`].
pub fn context(nsp: Arc<Namespace>, client: Arc<Client>) -> ConnectionContext {
    ConnectionContext::new(nsp, client)
}

/// Request-style facade over one realtime socket
pub struct ConnectionContext {
    socket: Socket,
    cookies: Cookies,
    query_cache: RefCell<HashMap<String, Arc<Query>>>,
}

impl ConnectionContext {
    /// Create the socket for `client` in `nsp` and bind a cookie jar to its
    /// handshake request, signed with the server's keys.
    pub fn new(nsp: Arc<Namespace>, client: Arc<Client>) -> Self {
        let socket = Socket::new(nsp, client);
        let cookies = Cookies::new(socket.request(), NoopResponse, socket.server().keys());
        Self {
            socket,
            cookies,
            query_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Cookie jar bound to the handshake request
    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    /// Mutable cookie jar, for setting cookies
    pub fn cookies_mut(&mut self) -> &mut Cookies {
        &mut self.cookies
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    // Forwarded socket properties

    /// Client handle of the socket
    pub fn client(&self) -> &Arc<Client> {
        self.socket.client()
    }

    /// Server options: proxy trust and signing keys
    pub fn server(&self) -> &Arc<Server> {
        self.socket.server()
    }

    /// Room adapter of the namespace
    pub fn adapter(&self) -> &Arc<Adapter> {
        self.socket.adapter()
    }

    /// Socket id
    pub fn id(&self) -> &str {
        self.socket.id()
    }

    /// Handshake request of the connection
    pub fn request(&self) -> &HandshakeRequest {
        self.socket.request()
    }

    /// Low-level connection
    pub fn conn(&self) -> &Conn {
        self.socket.conn()
    }

    /// Rooms the socket has joined
    pub fn rooms(&self) -> &[String] {
        self.socket.rooms()
    }

    /// Acknowledgements waiting for the client
    pub fn acks(&self) -> &HashMap<u64, AckCallback> {
        self.socket.acks()
    }

    /// JSON flag of the next emit
    pub fn json(&self) -> bool {
        self.socket.json()
    }

    /// Volatile flag of the next emit
    pub fn volatile(&self) -> bool {
        self.socket.volatile()
    }

    /// Operator emitting to every other socket
    pub fn broadcast(&mut self) -> BroadcastOperator {
        self.socket.broadcast()
    }

    /// Whether the socket is connected
    pub fn connected(&self) -> bool {
        self.socket.connected()
    }

    /// Whether the socket has disconnected
    pub fn disconnected(&self) -> bool {
        self.socket.disconnected()
    }

    /// Handshake data of the socket
    pub fn handshake(&self) -> &Handshake {
        self.socket.handshake()
    }

    /// Set the flags for the next emit
    pub fn set_flags(&mut self, flags: Flags) {
        self.socket.set_flags(flags);
    }

    // Forwarded socket methods

    /// Join `room`
    pub fn join(&mut self, room: impl Into<String>) -> &mut Self {
        self.socket.join(room);
        self
    }

    /// Leave `room`
    pub fn leave(&mut self, room: &str) -> &mut Self {
        self.socket.leave(room);
        self
    }

    /// Emit an event to the client
    pub fn emit(&mut self, event: &str, args: Vec<Value>) -> TransportResult<()> {
        self.socket.emit(event, args)
    }

    /// Emit an event and run `ack` when the client acknowledges it
    pub fn emit_with_ack<F>(&mut self, event: &str, args: Vec<Value>, ack: F) -> TransportResult<u64>
    where
        F: FnOnce(Vec<Value>) + Send + 'static,
    {
        self.socket.emit_with_ack(event, args, ack)
    }

    /// Operator targeting `room`
    pub fn to(&mut self, room: impl Into<String>) -> BroadcastOperator {
        self.socket.to(room)
    }

    /// Alias of [`ConnectionContext::to`]
    pub fn in_(&mut self, room: impl Into<String>) -> BroadcastOperator {
        self.socket.in_(room)
    }

    /// Emit a `message` event
    pub fn send(&mut self, args: Vec<Value>) -> TransportResult<()> {
        self.socket.send(args)
    }

    /// Alias of [`ConnectionContext::send`]
    pub fn write(&mut self, args: Vec<Value>) -> TransportResult<()> {
        self.socket.write(args)
    }

    /// Leave the namespace; with `close`, close the connection too
    pub fn disconnect(&mut self, close: bool) -> &mut Self {
        self.socket.disconnect(close);
        self
    }

    // Request accessors

    /// Handshake request headers
    pub fn header(&self) -> &HeaderMap {
        self.request().headers()
    }

    /// Alias of [`ConnectionContext::header`]
    pub fn headers(&self) -> &HeaderMap {
        self.header()
    }

    /// Request target as received
    pub fn url(&self) -> &str {
        self.request().url()
    }

    /// Pathname of the request target
    pub fn path(&self) -> &str {
        self.request().uri().path()
    }

    /// Query string without the leading `?`, or `""`
    pub fn querystring(&self) -> &str {
        self.request().uri().query().unwrap_or("")
    }

    /// Parsed query string.
    ///
    /// The parsed value is memoized per distinct query string, so repeated
    /// calls hand back the same `Arc`. An empty query string yields a fresh
    /// empty query and is not cached.
    pub fn query(&self) -> Arc<Query> {
        let querystring = self.querystring();
        if querystring.is_empty() {
            return Arc::new(Query::default());
        }

        let mut cache = self.query_cache.borrow_mut();
        if let Some(query) = cache.get(querystring) {
            return Arc::clone(query);
        }
        let query = Arc::new(Query::parse(querystring));
        cache.insert(querystring.to_string(), Arc::clone(&query));
        query
    }

    /// Query string with its leading `?`, or `""` when there is none
    pub fn search(&self) -> String {
        match self.querystring() {
            "" => String::new(),
            querystring => format!("?{}", querystring),
        }
    }

    /// `Host`, or `X-Forwarded-Host` when the server trusts a proxy.
    ///
    /// A comma-separated list resolves to its first entry.
    pub fn host(&self) -> Option<&str> {
        let forwarded = if self.server().proxy() {
            self.get("X-Forwarded-Host").filter(|h| !h.is_empty())
        } else {
            None
        };
        let host = forwarded
            .or_else(|| self.get("Host"))
            .filter(|h| !h.is_empty())?;
        host.split(',').next().map(str::trim)
    }

    /// [`ConnectionContext::host`] without the port
    pub fn hostname(&self) -> Option<&str> {
        let host = self.host()?;
        if host.starts_with('[') {
            // IPv6 literal, keep the brackets
            return Some(host.find(']').map_or(host, |end| &host[..=end]));
        }
        host.split(':').next()
    }

    /// `charset` parameter of `Content-Type`
    pub fn charset(&self) -> Option<String> {
        let content_type = self.get("Content-Type").filter(|t| !t.is_empty())?;
        match content_type.parse::<Mime>() {
            Ok(parsed) => parsed
                .get_param(mime::CHARSET)
                .map(|charset| charset.as_str().to_string()),
            Err(e) => {
                debug!("Unparsable Content-Type {:?}: {}", content_type, e);
                None
            }
        }
    }

    /// `Content-Length` as an integer. Non-numeric values count as 0; an
    /// absent header is `None`.
    pub fn length(&self) -> Option<i32> {
        self.get("Content-Length").map(to_int32)
    }

    /// `"https"` over TLS. Otherwise `"http"`, unless the server trusts a
    /// proxy, in which case the first `X-Forwarded-Proto` entry wins.
    pub fn protocol(&self) -> &str {
        if self.request().connection().encrypted {
            return "https";
        }
        if !self.server().proxy() {
            return "http";
        }
        self.get("X-Forwarded-Proto")
            .filter(|p| !p.is_empty())
            .and_then(|p| p.split(',').next())
            .map_or("http", str::trim)
    }

    /// Whether [`ConnectionContext::protocol`] is `"https"`
    pub fn secure(&self) -> bool {
        self.protocol() == "https"
    }

    /// Client address: the first forwarded address when the server trusts a
    /// proxy, otherwise the peer address of the connection.
    pub fn ip(&self) -> Option<&str> {
        self.ips()
            .first()
            .copied()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.conn().remote_address())
    }

    /// `X-Forwarded-For` addresses when the server trusts a proxy, client
    /// first and the nearest proxy last.
    pub fn ips(&self) -> Vec<&str> {
        if !self.server().proxy() {
            return Vec::new();
        }
        match self.get("X-Forwarded-For") {
            Some(list) if !list.is_empty() => list.split(',').map(str::trim).collect(),
            _ => Vec::new(),
        }
    }

    /// Case-insensitive header lookup. `Referer` and `Referrer` are
    /// interchangeable.
    ///
    /// Values with bytes outside ASCII are read as Latin-1 rather than
    /// treated as absent.
    pub fn get(&self, field: &str) -> Option<&str> {
        let request = self.request();
        match field.to_ascii_lowercase().as_str() {
            "referer" | "referrer" => request
                .header_text("referrer")
                .or_else(|| request.header_text(REFERER.as_str())),
            name => request.header_text(name),
        }
    }

    /// Headers cannot be set on a realtime connection; this only traces the
    /// attempt.
    pub fn set(&self, field: &str, value: impl fmt::Display) {
        debug!(
            socket = %self.id(),
            field = %field,
            value = %value,
            "Cannot set a header on a realtime connection"
        );
    }
}

/// Coerce a header value to a number, then truncate it to a signed 32-bit
/// integer with wrap-around. Anything unparsable becomes 0.
fn to_int32(raw: &str) -> i32 {
    let number = to_number(raw.trim());
    if !number.is_finite() {
        return 0;
    }
    let wrapped = number.trunc().rem_euclid(4_294_967_296.0);
    if wrapped >= 2_147_483_648.0 {
        (wrapped - 4_294_967_296.0) as i32
    } else {
        wrapped as i32
    }
}

fn to_number(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let radix = match s.get(..2) {
        Some("0x" | "0X") => 16,
        Some("0o" | "0O") => 8,
        Some("0b" | "0B") => 2,
        _ => 10,
    };
    if radix != 10 {
        let digits = &s[2..];
        if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
            return f64::NAN;
        }
        return u64::from_str_radix(digits, radix).map_or(f64::INFINITY, |n| n as f64);
    }

    s.parse::<f64>().unwrap_or(f64::NAN)
}
