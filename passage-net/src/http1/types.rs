use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

pub const HTTP_DEFAULT_PORT: u16 = 80;
pub const TUNNEL_DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        let method = match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "HEAD" => Self::Head,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Head => "HEAD",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    /// CONNECT opens an opaque tunnel; every other method is forwarded as-is.
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Self::Connect)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_tunnel() {
            TUNNEL_DEFAULT_PORT
        } else {
            HTTP_DEFAULT_PORT
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Other(String),
}

impl HttpVersion {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::Other(other) => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The first message of a proxied connection.
///
/// `raw` is the exact buffer the request was parsed from and is what gets
/// forwarded for non-tunnel methods. `body` is only the fragment that arrived
/// with the head; nothing past it is read here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    pub target: String,
    pub version: HttpVersion,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub destination: Option<Destination>,
    pub raw: Vec<u8>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str).or_else(|| {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        })
    }

    pub fn is_tunnel(&self) -> bool {
        self.method.is_tunnel()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_header_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub kind: ParseWarningKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarningKind {
    UnknownVersion(String),
    DuplicateHeader(String),
    MissingHeadTerminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at offset {offset}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("no line terminator")]
    MissingLineTerminator,
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("invalid header line")]
    InvalidHeaderLine,
    #[error("invalid host port {0:?}")]
    InvalidHostPort(String),
    #[error("request head is not utf-8")]
    InvalidEncoding,
    #[error("request head too large")]
    HeaderTooLarge,
}
