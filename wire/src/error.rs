use crate::types::FrameType;
use std::fmt;
use thiserror::Error;

/// Why a frame could not be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    /// No bytes at all.
    Empty,
    /// The header byte is not a known tag.
    BadHeader,
    /// The payload is the wrong size for its tag.
    Length,
    /// The payload is the right size but its content is malformed.
    ParseFail,
    /// The tag is known but this decoder does not handle it.
    UnknownType,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeErrorKind::Empty => "empty",
            DecodeErrorKind::BadHeader => "bad header",
            DecodeErrorKind::Length => "length",
            DecodeErrorKind::ParseFail => "parse fail",
            DecodeErrorKind::UnknownType => "unknown type",
        };
        f.write_str(name)
    }
}

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("{kind} error decoding {frame_type:?} frame")]
pub struct DecodeError {
    kind: DecodeErrorKind,
    frame_type: FrameType,
}

impl DecodeError {
    pub(crate) fn new(kind: DecodeErrorKind, frame_type: FrameType) -> Self {
        Self { kind, frame_type }
    }

    pub fn kind(&self) -> DecodeErrorKind {
        self.kind
    }

    /// The frame type named by the header, `FrameType::Unknown` when the header
    /// was missing or unrecognized.
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }
}
