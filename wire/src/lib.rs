//! Binary frame protocol spoken between a sandboxed job and the relay that
//! drives the shared screen.
//!
//! A frame is one header byte (the [`FrameType`] tag) followed by a payload
//! whose shape depends on the tag. Multi-byte integers are big-endian and
//! text is UTF-16 (big-endian, no byte order mark).
//!
//! On the job-to-relay stream each frame is preceded by its length as a
//! 4-byte big-endian integer, see [`stream_codec`].

pub mod client;
mod error;
mod frame;
mod types;

pub use error::{DecodeError, DecodeErrorKind};
pub use frame::{decode, Frame};
pub use types::{Color, ErrorCode, FrameType};

use tokio_util::codec::LengthDelimitedCodec;

/// Pixels a `SetPixel` index can address.
pub const MAX_PIXELS: usize = 1 << 16;

/// Longest frame accepted on a stream. A `DrawText` with a long string is
/// the only frame that gets close.
pub const MAX_FRAME_LEN: usize = 4096;

/// Length-prefixed framing shared by [`client::ScreenClient`] and the relay.
pub fn stream_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_pixel_wire_bytes() {
        let frame = Frame::SetPixel {
            index: 10,
            color: Color::new(0xFF0000),
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[..], &[0x15, 0x00, 0x0A, 0xFF, 0x00, 0x00]);

        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.frame_type(), FrameType::SetPixel);
        match decoded {
            Frame::SetPixel { index, color } => {
                assert_eq!(index, 10);
                assert_eq!(color.value(), 0xFF0000);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn well_formed_frames_round_trip() {
        let frames = [
            Frame::Fill {
                color: Color::new(0x00FF7F),
            },
            Frame::SetPixel {
                index: u16::MAX,
                color: Color::new(0xFFFFFF),
            },
            Frame::ScreenInfo {
                width: 64,
                height: 16,
            },
            Frame::Err {
                code: ErrorCode::OutOfBounds,
                message: "pixel 9000 is off the screen \u{1F4A5}".into(),
            },
            Frame::Ack,
            Frame::Nak,
            Frame::Render,
            Frame::Clear,
        ];
        for frame in frames {
            assert_eq!(decode(&frame.encode()), Ok(frame.clone()));
        }
    }

    #[test]
    fn empty_input() {
        let err = decode(&[]).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::Empty);
    }

    #[test]
    fn bad_header() {
        let err = decode(&[99]).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::BadHeader);
        assert_eq!(err.frame_type(), FrameType::Unknown);
    }

    #[test]
    fn short_set_pixel_is_a_length_error() {
        let err = decode(&[21, 0x00, 0x0A]).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::Length);
        assert_eq!(err.frame_type(), FrameType::SetPixel);
    }
}
