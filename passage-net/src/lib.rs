mod http1;

pub use http1::{
    Destination, HttpVersion, Limits, Method, ParseError, ParseErrorKind, ParseStatus,
    ParseWarning, ParseWarningKind, ParsedRequest, RequestParser, find_head_end, parse_request,
    parse_request_with_limits,
};
