use std::collections::BTreeMap;

use super::types::{
    Destination, HttpVersion, Limits, Method, ParseError, ParseErrorKind, ParseWarning,
    ParseWarningKind, ParsedRequest,
};

const CRLF: &[u8] = b"\r\n";
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const HOST_HEADER: &str = "Host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMore {
        warnings: Vec<ParseWarning>,
    },
    Complete {
        message: ParsedRequest,
        warnings: Vec<ParseWarning>,
    },
    Error {
        error: ParseError,
        warnings: Vec<ParseWarning>,
    },
}

/// Accumulates the first bytes of a connection until a request head can be parsed.
///
/// Everything pushed before the head completes becomes part of the request:
/// bytes past the blank line are kept as the body fragment, not as a second
/// message.
#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus {
        self.buffer.extend_from_slice(bytes);
        match find_head_end(&self.buffer) {
            Some(head_end) if head_end > self.limits.max_header_bytes => {
                self.fail(header_too_large(self.limits))
            }
            Some(head_end) => {
                let result = parse_request_from_buffer(
                    &self.buffer,
                    head_end,
                    head_end + HEAD_TERMINATOR.len(),
                    &mut self.warnings,
                );
                self.settle(result)
            }
            None if self.buffer.len() > self.limits.max_header_bytes => {
                self.fail(header_too_large(self.limits))
            }
            None => ParseStatus::NeedMore {
                warnings: self.warnings.clone(),
            },
        }
    }

    /// Parses whatever is buffered when no more bytes will arrive.
    ///
    /// A head without the terminating blank line is accepted as long as it
    /// holds at least one line terminator; the body fragment is then empty.
    pub fn finish(&mut self) -> ParseStatus {
        if let Some(head_end) = find_head_end(&self.buffer) {
            let result = parse_request_from_buffer(
                &self.buffer,
                head_end,
                head_end + HEAD_TERMINATOR.len(),
                &mut self.warnings,
            );
            return self.settle(result);
        }

        if find_line_end(&self.buffer, 0).is_none() {
            return self.fail(ParseError {
                kind: ParseErrorKind::MissingLineTerminator,
                offset: self.buffer.len(),
            });
        }

        let head_end = if self.buffer.ends_with(CRLF) {
            self.buffer.len() - CRLF.len()
        } else {
            self.buffer.len()
        };
        self.warnings.push(ParseWarning {
            kind: ParseWarningKind::MissingHeadTerminator,
            offset: head_end,
        });
        let result = parse_request_from_buffer(
            &self.buffer,
            head_end,
            self.buffer.len(),
            &mut self.warnings,
        );
        self.settle(result)
    }

    fn settle(&mut self, result: Result<ParsedRequest, ParseError>) -> ParseStatus {
        match result {
            Ok(message) => {
                self.buffer.clear();
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Complete { message, warnings }
            }
            Err(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: ParseError) -> ParseStatus {
        let warnings = std::mem::take(&mut self.warnings);
        ParseStatus::Error { error, warnings }
    }
}

pub fn parse_request(bytes: &[u8]) -> Result<ParsedRequest, ParseError> {
    parse_request_with_limits(bytes, Limits::default())
}

pub fn parse_request_with_limits(bytes: &[u8], limits: Limits) -> Result<ParsedRequest, ParseError> {
    let mut parser = RequestParser::with_limits(limits);
    let status = match parser.push(bytes) {
        ParseStatus::NeedMore { .. } => parser.finish(),
        other => other,
    };
    match status {
        ParseStatus::Complete { message, .. } => Ok(message),
        ParseStatus::Error { error, .. } => Err(error),
        ParseStatus::NeedMore { .. } => Err(ParseError {
            kind: ParseErrorKind::MissingLineTerminator,
            offset: bytes.len(),
        }),
    }
}

pub fn find_head_end(buffer: &[u8]) -> Option<usize> {
    twoway::find_bytes(buffer, HEAD_TERMINATOR)
}

fn find_line_end(buffer: &[u8], start: usize) -> Option<usize> {
    twoway::find_bytes(&buffer[start..], CRLF).map(|offset| start + offset)
}

fn header_too_large(limits: Limits) -> ParseError {
    ParseError {
        kind: ParseErrorKind::HeaderTooLarge,
        offset: limits.max_header_bytes,
    }
}

fn parse_request_from_buffer(
    buffer: &[u8],
    head_end: usize,
    body_start: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<ParsedRequest, ParseError> {
    let head = &buffer[..head_end];
    let line_end = find_line_end(head, 0).unwrap_or(head.len());
    let (method, target, version) = parse_request_line(&head[..line_end], 0, warnings)?;

    let headers_start = (line_end + CRLF.len()).min(head.len());
    let headers = parse_headers(&head[headers_start..], headers_start, warnings)?;
    let destination = resolve_destination(&headers, method, headers_start)?;

    Ok(ParsedRequest {
        method,
        target,
        version,
        headers,
        body: buffer[body_start.min(buffer.len())..].to_vec(),
        destination,
        raw: buffer.to_vec(),
    })
}

fn parse_request_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<(Method, String, HttpVersion), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidEncoding,
        offset,
    })?;

    let parts: Vec<&str> = text.split(' ').collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(ParseError {
            kind: ParseErrorKind::InvalidRequestLine,
            offset,
        });
    };
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError {
            kind: ParseErrorKind::InvalidRequestLine,
            offset,
        });
    }

    let method = Method::from_token(method).ok_or_else(|| ParseError {
        kind: ParseErrorKind::UnknownMethod(method.to_string()),
        offset,
    })?;
    let version = parse_http_version(version, offset, warnings);

    Ok((method, target.to_string(), version))
}

fn parse_http_version(
    version_raw: &str,
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::UnknownVersion(other.to_string()),
                offset,
            });
            HttpVersion::Other(other.to_string())
        }
    }
}

fn parse_headers(
    bytes: &[u8],
    base_offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<BTreeMap<String, String>, ParseError> {
    let mut headers = BTreeMap::new();
    if bytes.is_empty() {
        return Ok(headers);
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidEncoding,
        offset: base_offset,
    })?;

    let mut offset = base_offset;
    for line in text.split("\r\n") {
        let line_offset = offset;
        offset += line.len() + CRLF.len();
        if line.is_empty() {
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidHeaderLine,
                offset: line_offset,
            });
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidHeaderLine,
                offset: line_offset,
            });
        }

        // Last occurrence wins.
        if headers
            .insert(name.to_string(), value.trim().to_string())
            .is_some()
        {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::DuplicateHeader(name.to_string()),
                offset: line_offset,
            });
        }
    }

    Ok(headers)
}

fn resolve_destination(
    headers: &BTreeMap<String, String>,
    method: Method,
    offset: usize,
) -> Result<Option<Destination>, ParseError> {
    let host_header = headers.get(HOST_HEADER).or_else(|| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(HOST_HEADER))
            .map(|(_, value)| value)
    });
    let Some(host_header) = host_header else {
        return Ok(None);
    };

    let (host, port) = split_host_port(host_header);
    if host.is_empty() {
        return Ok(None);
    }

    let port = match port {
        Some(port) if !port.is_empty() => port.parse::<u16>().map_err(|_| ParseError {
            kind: ParseErrorKind::InvalidHostPort(port.to_string()),
            offset,
        })?,
        _ => method.default_port(),
    };

    Ok(Some(Destination {
        host: host.to_string(),
        port,
    }))
}

fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            return (host, after.strip_prefix(':'));
        }
    }
    match value.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (value, None),
    }
}
