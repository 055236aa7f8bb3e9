//! Client handle and handshake request
//!
//! A `Client` is one accepted WebSocket connection: the upgrade request that
//! opened it plus the low-level connection its sockets write to.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderValue, COOKIE};
use http::Uri;
use thiserror::Error;
use uuid::Uuid;

use super::Outbox;

/// Errors building a handshake request
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request target '{url}': {source}")]
    InvalidUri {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },
}

/// Connection-level facts about the handshake request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestConnection {
    /// Whether the request arrived over TLS
    pub encrypted: bool,
}

/// The upgrade request captured when the connection was accepted
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    url: String,
    uri: Uri,
    headers: HeaderMap,
    text: HashMap<String, String>,
    connection: RequestConnection,
}

impl HandshakeRequest {
    /// Build a handshake request from a raw request target and its headers.
    ///
    /// Repeated headers are folded into one value the way HTTP servers
    /// present them: joined with `", "`, or `"; "` for `Cookie`.
    pub fn new(url: impl Into<String>, headers: HeaderMap) -> Result<Self, RequestError> {
        let url = url.into();
        let uri = url
            .parse::<Uri>()
            .map_err(|source| RequestError::InvalidUri {
                url: url.clone(),
                source,
            })?;

        let headers = fold_duplicates(&headers);
        Ok(Self {
            url,
            uri,
            text: decode_headers(&headers),
            headers,
            connection: RequestConnection::default(),
        })
    }

    /// Build a handshake request from an already-parsed HTTP request
    pub fn from_http<B>(request: &http::Request<B>) -> Self {
        let uri = request.uri().clone();
        let headers = fold_duplicates(request.headers());
        Self {
            url: uri.to_string(),
            uri,
            text: decode_headers(&headers),
            headers,
            connection: RequestConnection::default(),
        }
    }

    /// Mark the request as received over an encrypted transport
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.connection.encrypted = encrypted;
        self
    }

    /// The request target as received
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The parsed request target
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request headers, one value per name
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Text of header `name` (lowercase). Never fails on non-ASCII bytes.
    pub fn header_text(&self, name: &str) -> Option<&str> {
        self.text.get(name).map(String::as_str)
    }

    /// Transport facts, such as whether TLS was used
    pub fn connection(&self) -> RequestConnection {
        self.connection
    }
}

/// Headers where only the first occurrence counts; later copies are dropped
const SINGLE_VALUE_HEADERS: &[&str] = &[
    "age",
    "authorization",
    "content-length",
    "content-type",
    "etag",
    "expires",
    "from",
    "host",
    "if-modified-since",
    "if-unmodified-since",
    "last-modified",
    "location",
    "max-forwards",
    "proxy-authorization",
    "referer",
    "retry-after",
    "server",
    "user-agent",
];

fn fold_duplicates(headers: &HeaderMap) -> HeaderMap {
    let mut folded = HeaderMap::with_capacity(headers.keys_len());

    for name in headers.keys() {
        let mut values = headers.get_all(name).iter();
        let Some(first) = values.next() else {
            continue;
        };

        if SINGLE_VALUE_HEADERS.contains(&name.as_str()) {
            folded.insert(name.clone(), first.clone());
            continue;
        }

        let separator: &[u8] = if name == COOKIE { b"; " } else { b", " };
        let mut joined = first.as_bytes().to_vec();
        let mut repeated = false;
        for value in values {
            joined.extend_from_slice(separator);
            joined.extend_from_slice(value.as_bytes());
            repeated = true;
        }

        let value = if repeated {
            HeaderValue::from_bytes(&joined).unwrap_or_else(|_| first.clone())
        } else {
            first.clone()
        };
        folded.insert(name.clone(), value);
    }

    folded
}

/// Header values as text, keyed by lowercase name. Bytes outside ASCII are
/// read as Latin-1.
fn decode_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let text = match value.to_str() {
                Ok(text) => text.to_string(),
                Err(_) => value.as_bytes().iter().map(|&b| char::from(b)).collect(),
            };
            (name.as_str().to_string(), text)
        })
        .collect()
}

/// The low-level connection under a client
#[derive(Debug)]
pub struct Conn {
    id: String,
    remote_address: Option<String>,
    outbox: Outbox,
}

impl Conn {
    /// Create a connection with a fresh id
    pub fn new(remote_address: Option<String>, outbox: Outbox) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            remote_address,
            outbox,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer IP address, without port
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

/// One accepted WebSocket connection
#[derive(Debug)]
pub struct Client {
    conn: Conn,
    request: HandshakeRequest,
}

impl Client {
    pub fn new(conn: Conn, request: HandshakeRequest) -> Self {
        Self { conn, request }
    }

    /// Client id, shared with its low-level connection
    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Close the underlying connection, disconnecting every socket on it
    pub fn close(&self) {
        self.conn.outbox.close();
    }
}
