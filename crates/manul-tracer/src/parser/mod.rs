//! Request and response parsing
//!
//! Parsers are pure functions over captured bytes. They never fail the traced
//! call: the infallible entry points return empty results for input they
//! cannot read, and `try_` variants report why.

mod image;
mod request;
mod response;

pub use image::{describe_data_url, redact_image_blocks, sniff_dimensions};
pub use request::{parse_request, try_parse_request, ConversationTurn, ParsedRequest, RequestParams};
pub use response::{parse_response, ParsedResponse, RateLimits, TokenUsage};

use thiserror::Error;

/// Why a body could not be parsed
#[derive(Error, Debug)]
pub enum ParseError {
    /// Nothing to parse
    #[error("body is empty")]
    Empty,

    /// Body is not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Body is JSON but not an object
    #[error("body is not a JSON object")]
    NotAnObject,
}

impl From<ParseError> for crate::Error {
    fn from(err: ParseError) -> Self {
        crate::Error::Parse(err.to_string())
    }
}
