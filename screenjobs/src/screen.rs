//! The screen collaborator: the shared output hardware, as seen by the relay
//! and by built-in programs.

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use wire::Color;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScreenError {
    #[error("pixel {index} is outside a screen of {pixel_count} pixels")]
    OutOfBounds { index: u16, pixel_count: usize },
    #[error("screen unavailable: {0}")]
    Unavailable(String),
}

/// Drawing operations on the shared screen.
///
/// Drawing changes a back buffer; `render` makes it visible.
pub trait Screen: Send + Sync {
    fn width(&self) -> u16;
    fn height(&self) -> u16;

    fn pixel_count(&self) -> usize {
        usize::from(self.width()) * usize::from(self.height())
    }

    fn render(&self) -> Result<(), ScreenError>;
    fn set_pixel(&self, index: u16, color: Color) -> Result<(), ScreenError>;
    fn fill(&self, color: Color) -> Result<(), ScreenError>;

    fn clear(&self) -> Result<(), ScreenError> {
        self.fill(Color::BLACK)
    }

    fn draw_text(&self, index: u16, text: &str, color: Color) -> Result<(), ScreenError>;
}

#[derive(Debug)]
struct Canvas {
    pixels: Vec<Color>,
    shown: Vec<Color>,
    renders: u64,
    texts: Vec<(u16, String, Color)>,
}

/// An in-memory screen. Keeps the back buffer and the last rendered frame
/// separately so callers can see what was actually shown.
#[derive(Debug)]
pub struct SimulatedScreen {
    width: u16,
    height: u16,
    canvas: Mutex<Canvas>,
}

impl SimulatedScreen {
    pub fn new(width: u16, height: u16) -> Self {
        let count = usize::from(width) * usize::from(height);
        Self {
            width,
            height,
            canvas: Mutex::new(Canvas {
                pixels: vec![Color::BLACK; count],
                shown: vec![Color::BLACK; count],
                renders: 0,
                texts: Vec::new(),
            }),
        }
    }

    fn canvas(&self) -> MutexGuard<'_, Canvas> {
        self.canvas.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Color of a pixel in the back buffer.
    pub fn pixel(&self, index: u16) -> Option<Color> {
        self.canvas().pixels.get(usize::from(index)).copied()
    }

    /// The frame shown by the most recent render.
    pub fn shown(&self) -> Vec<Color> {
        self.canvas().shown.clone()
    }

    pub fn render_count(&self) -> u64 {
        self.canvas().renders
    }

    /// Text draw requests received so far. Text is recorded, not rasterized.
    pub fn texts(&self) -> Vec<(u16, String, Color)> {
        self.canvas().texts.clone()
    }

    fn check_index(&self, index: u16) -> Result<usize, ScreenError> {
        let index_usize = usize::from(index);
        if index_usize < self.pixel_count() {
            Ok(index_usize)
        } else {
            Err(ScreenError::OutOfBounds {
                index,
                pixel_count: self.pixel_count(),
            })
        }
    }
}

impl Screen for SimulatedScreen {
    fn width(&self) -> u16 {
        self.width
    }

    fn height(&self) -> u16 {
        self.height
    }

    fn render(&self) -> Result<(), ScreenError> {
        let mut canvas = self.canvas();
        canvas.shown = canvas.pixels.clone();
        canvas.renders += 1;
        Ok(())
    }

    fn set_pixel(&self, index: u16, color: Color) -> Result<(), ScreenError> {
        let index = self.check_index(index)?;
        self.canvas().pixels[index] = color;
        Ok(())
    }

    fn fill(&self, color: Color) -> Result<(), ScreenError> {
        self.canvas().pixels.iter_mut().for_each(|p| *p = color);
        Ok(())
    }

    fn draw_text(&self, index: u16, text: &str, color: Color) -> Result<(), ScreenError> {
        self.check_index(index)?;
        self.canvas().texts.push((index, text.to_string(), color));
        Ok(())
    }
}
