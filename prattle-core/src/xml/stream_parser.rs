use thiserror::Error;

use crate::xml::Nad;
use crate::xmpp::error::StreamErrorCondition;
use crate::xmpp::stream_header::StreamHeader;

pub mod rusty_xml;

pub use rusty_xml::NadStreamParser;

/// One unit of progress on an inbound XML stream.
#[derive(Debug)]
pub enum Frame {
    StreamStart(StreamHeader),
    Element(Nad),
    StreamEnd,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("stream is not well-formed XML")]
    NotWellFormed,
    #[error("unsupported stream namespace")]
    InvalidNamespace,
    #[error("stanza exceeds the configured size limit")]
    StanzaTooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// The stream error to report to the peer before closing, if any.
    pub fn condition(&self) -> Option<StreamErrorCondition> {
        match self {
            ParseError::NotWellFormed => Some(StreamErrorCondition::BadFormat),
            ParseError::InvalidNamespace => Some(StreamErrorCondition::InvalidNamespace),
            ParseError::StanzaTooLarge => Some(StreamErrorCondition::PolicyViolation),
            ParseError::Io(_) => None,
        }
    }
}
