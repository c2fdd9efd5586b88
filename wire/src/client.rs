//! The job-side half of the contract: the command line a sandboxed job is
//! started with, and a client that sends frames to the relay.

use crate::frame::Frame;
use crate::stream_codec;
use crate::types::Color;
use bytes::Bytes;
use clap::Parser;
use futures::SinkExt;
use std::io;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

/// Arguments handed to every sandboxed job.
///
/// A job either draws to a simulated screen of its own (`--simulate`) or
/// sends frames to the relay at `--screen-host`/`--tx-port`.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct ClientArgs {
    /// Horizontal pixel count
    #[clap(long = "screen-width")]
    pub screen_width: u16,

    /// Vertical pixel count
    #[clap(long = "screen-height")]
    pub screen_height: u16,

    /// Draw to a local simulation instead of the shared screen
    #[clap(long, conflicts_with_all = &["screen-host", "tx-port"])]
    pub simulate: bool,

    /// Host the relay listens on
    #[clap(long = "screen-host", required_unless_present = "simulate")]
    pub screen_host: Option<String>,

    /// Port the relay listens on
    #[clap(long = "tx-port", required_unless_present = "simulate")]
    pub tx_port: Option<u16>,
}

impl ClientArgs {
    pub fn simulated(screen_width: u16, screen_height: u16) -> Self {
        Self {
            screen_width,
            screen_height,
            simulate: true,
            screen_host: None,
            tx_port: None,
        }
    }

    pub fn relayed(screen_width: u16, screen_height: u16, host: &str, port: u16) -> Self {
        Self {
            screen_width,
            screen_height,
            simulate: false,
            screen_host: Some(host.to_string()),
            tx_port: Some(port),
        }
    }

    /// Render back to command-line flags, in the order jobs expect them.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--screen-width".to_string(),
            self.screen_width.to_string(),
            "--screen-height".to_string(),
            self.screen_height.to_string(),
        ];
        match (&self.screen_host, self.tx_port) {
            (Some(host), Some(port)) if !self.simulate => {
                args.push("--screen-host".to_string());
                args.push(host.clone());
                args.push("--tx-port".to_string());
                args.push(port.to_string());
            }
            _ => args.push("--simulate".to_string()),
        }
        args
    }
}

/// Sends frames to a relay over a TCP stream. The relay never answers;
/// a full socket buffer makes `send` wait rather than drop frames.
pub struct ScreenClient {
    frames: FramedWrite<TcpStream, LengthDelimitedCodec>,
    width: u16,
    height: u16,
}

impl ScreenClient {
    /// Connect using the arguments a job was started with.
    ///
    /// Fails with `InvalidInput` for simulated jobs, which have no relay.
    pub async fn from_args(args: &ClientArgs) -> io::Result<Self> {
        match (&args.screen_host, args.tx_port) {
            (Some(host), Some(port)) if !args.simulate => {
                Self::connect(host, port, args.screen_width, args.screen_height).await
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "job was started in simulation mode",
            )),
        }
    }

    pub async fn connect(host: &str, port: u16, width: u16, height: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            frames: FramedWrite::new(stream, stream_codec()),
            width,
            height,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.frames.send(frame.encode()).await
    }

    /// Send raw bytes as one frame, whether or not they decode.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.frames.send(Bytes::copy_from_slice(bytes)).await
    }

    pub async fn render(&mut self) -> io::Result<()> {
        self.send(&Frame::Render).await
    }

    pub async fn set_pixel(&mut self, index: u16, color: Color) -> io::Result<()> {
        self.send(&Frame::SetPixel { index, color }).await
    }

    pub async fn fill(&mut self, color: Color) -> io::Result<()> {
        self.send(&Frame::Fill { color }).await
    }

    pub async fn clear(&mut self) -> io::Result<()> {
        self.send(&Frame::Clear).await
    }

    /// Flush anything buffered and shut down the write half.
    pub async fn close(mut self) -> io::Result<()> {
        SinkExt::<Bytes>::close(&mut self.frames).await
    }
}
