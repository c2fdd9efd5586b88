use std::fmt;

/// Header tag of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Ack = 1,
    Nak = 2,
    Err = 3,
    ScreenInfo = 10,
    Render = 20,
    SetPixel = 21,
    Clear = 22,
    Fill = 23,
    LoadFont = 24,
    DrawText = 25,
    DrawPoly = 26,
    DrawEllipse = 27,
    FillImage = 28,
    PlayVideo = 29,
    Unknown = 255,
}

impl FrameType {
    /// Map a header byte to its frame type. `None` for bytes that are not a tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        use FrameType::*;
        let frame_type = match tag {
            1 => Ack,
            2 => Nak,
            3 => Err,
            10 => ScreenInfo,
            20 => Render,
            21 => SetPixel,
            22 => Clear,
            23 => Fill,
            24 => LoadFont,
            25 => DrawText,
            26 => DrawPoly,
            27 => DrawEllipse,
            28 => FillImage,
            29 => PlayVideo,
            _ => return None,
        };
        Some(frame_type)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A 24-bit RGB color packed as `0xRRGGBB`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Color(u32);

impl Color {
    pub const BLACK: Color = Color(0);

    /// Bits above the low 24 are discarded.
    pub const fn new(rgb: u32) -> Self {
        Self(rgb & 0x00FF_FFFF)
    }

    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for Color {
    fn from(rgb: u32) -> Self {
        Color::new(rgb)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.0)
    }
}

/// Error codes carried by `Err` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownFont,
    OutOfBounds,
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        match code {
            1 => ErrorCode::UnknownFont,
            2 => ErrorCode::OutOfBounds,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownFont => 1,
            ErrorCode::OutOfBounds => 2,
            ErrorCode::Other(other) => other,
        }
    }
}
