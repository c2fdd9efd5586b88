use crate::error::{DecodeError, DecodeErrorKind};
use crate::types::{Color, ErrorCode, FrameType};
use bytes::{BufMut, Bytes, BytesMut};

/// A decoded frame.
///
/// `DrawText` and the other drawing tags are reserved: they are recognized in
/// headers but have no payload layout yet, so they never appear here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nak,
    Err { code: ErrorCode, message: String },
    ScreenInfo { width: u16, height: u16 },
    Render,
    SetPixel { index: u16, color: Color },
    Clear,
    Fill { color: Color },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Ack => FrameType::Ack,
            Frame::Nak => FrameType::Nak,
            Frame::Err { .. } => FrameType::Err,
            Frame::ScreenInfo { .. } => FrameType::ScreenInfo,
            Frame::Render => FrameType::Render,
            Frame::SetPixel { .. } => FrameType::SetPixel,
            Frame::Clear => FrameType::Clear,
            Frame::Fill { .. } => FrameType::Fill,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.frame_type().tag());
        match self {
            Frame::Ack | Frame::Nak | Frame::Render | Frame::Clear => {}
            Frame::Err { code, message } => {
                buf.put_u8((*code).into());
                for unit in message.encode_utf16() {
                    buf.put_u16(unit);
                }
            }
            Frame::ScreenInfo { width, height } => {
                buf.put_u16(*width);
                buf.put_u16(*height);
            }
            Frame::SetPixel { index, color } => {
                buf.put_u16(*index);
                put_color(&mut buf, *color);
            }
            Frame::Fill { color } => put_color(&mut buf, *color),
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Ack | Frame::Nak | Frame::Render | Frame::Clear => 0,
            Frame::Err { message, .. } => 1 + 2 * message.encode_utf16().count(),
            Frame::ScreenInfo { .. } => 4,
            Frame::SetPixel { .. } => 5,
            Frame::Fill { .. } => 3,
        }
    }
}

fn put_color(buf: &mut BytesMut, color: Color) {
    buf.put_uint(u64::from(color.value()), 3);
}

fn read_color(bytes: &[u8]) -> Color {
    Color::new(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Decode a single frame.
///
/// Pure: the same bytes always produce the same result.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let (&header, payload) = bytes
        .split_first()
        .ok_or_else(|| DecodeError::new(DecodeErrorKind::Empty, FrameType::Unknown))?;
    let frame_type = FrameType::from_tag(header)
        .ok_or_else(|| DecodeError::new(DecodeErrorKind::BadHeader, FrameType::Unknown))?;
    let fail = |kind| DecodeError::new(kind, frame_type);
    let expect_len = |len: usize| {
        if payload.len() == len {
            Ok(())
        } else {
            Err(fail(DecodeErrorKind::Length))
        }
    };

    match frame_type {
        FrameType::Ack => expect_len(0).map(|_| Frame::Ack),
        FrameType::Nak => expect_len(0).map(|_| Frame::Nak),
        FrameType::Render => expect_len(0).map(|_| Frame::Render),
        FrameType::Clear => expect_len(0).map(|_| Frame::Clear),
        FrameType::Err => {
            let (&code, text) = payload
                .split_first()
                .ok_or_else(|| fail(DecodeErrorKind::Length))?;
            let message = decode_utf16_be(text).ok_or_else(|| fail(DecodeErrorKind::ParseFail))?;
            Ok(Frame::Err {
                code: code.into(),
                message,
            })
        }
        FrameType::ScreenInfo => {
            expect_len(4)?;
            Ok(Frame::ScreenInfo {
                width: read_u16(&payload[..2]),
                height: read_u16(&payload[2..]),
            })
        }
        FrameType::SetPixel => {
            expect_len(5)?;
            Ok(Frame::SetPixel {
                index: read_u16(&payload[..2]),
                color: read_color(&payload[2..]),
            })
        }
        FrameType::Fill => {
            expect_len(3)?;
            Ok(Frame::Fill {
                color: read_color(payload),
            })
        }
        FrameType::LoadFont
        | FrameType::DrawText
        | FrameType::DrawPoly
        | FrameType::DrawEllipse
        | FrameType::FillImage
        | FrameType::PlayVideo
        | FrameType::Unknown => Err(fail(DecodeErrorKind::UnknownType)),
    }
}

fn decode_utf16_be(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units = bytes.chunks_exact(2).map(read_u16);
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}
