mod parser;
mod types;

pub use parser::{
    ParseStatus, RequestParser, find_head_end, parse_request, parse_request_with_limits,
};
pub use types::{
    Destination, HttpVersion, Limits, Method, ParseError, ParseErrorKind, ParseWarning,
    ParseWarningKind, ParsedRequest,
};
