use super::RelayStats;
use crate::screen::Screen;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use wire::Frame;

pub struct Relay {
    listener: TcpListener,
    screen: Arc<dyn Screen>,
    poll_interval: Duration,
    stop_rx: watch::Receiver<bool>,
    stats: RelayStats,
}

impl Relay {
    pub fn spawn(
        listener: TcpListener,
        screen: Arc<dyn Screen>,
        poll_interval: Duration,
        stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<RelayStats> {
        let actor = Self {
            listener,
            screen,
            poll_interval,
            stop_rx,
            stats: RelayStats::default(),
        };
        tokio::spawn(async move { actor.run().await })
    }

    fn stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn run(mut self) -> RelayStats {
        while !self.stopping() {
            tokio::select! {
                biased;
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        // handle dropped without a stop
                        break;
                    }
                }
                accepted = tokio::time::timeout(self.poll_interval, self.listener.accept()) => {
                    match accepted {
                        Err(_) => {}
                        Ok(Ok((stream, peer))) => {
                            if !self.serve(stream, peer).await {
                                break;
                            }
                        }
                        Ok(Err(e)) => tracing::warn!(error = %e, "relay accept failed"),
                    }
                }
            }
        }
        tracing::debug!(
            handled = self.stats.handled,
            rejected = self.stats.rejected,
            "relay stopped"
        );
        self.stats
    }

    /// Apply frames from one connection until it closes. Connections are
    /// served one at a time, so frames are handled in the order they were
    /// written. Returns false once the relay has been told to stop.
    async fn serve(&mut self, stream: TcpStream, peer: SocketAddr) -> bool {
        tracing::debug!(%peer, "job connected to relay");
        let mut frames = FramedRead::new(stream, wire::stream_codec());
        loop {
            tokio::select! {
                biased;
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || self.stopping() {
                        self.drain(&mut frames, peer).await;
                        return false;
                    }
                }
                next = frames.next() => match next {
                    Some(Ok(bytes)) => self.handle(&bytes, peer),
                    Some(Err(e)) => {
                        // the length prefix can no longer be trusted
                        tracing::warn!(%peer, error = %e, "dropping relay connection");
                        self.stats.rejected += 1;
                        return true;
                    }
                    None => {
                        tracing::debug!(%peer, "job disconnected from relay");
                        return true;
                    }
                },
            }
        }
    }

    /// Apply frames already written before a stop, until the job closes
    /// the stream or goes quiet for a poll interval.
    async fn drain(&mut self, frames: &mut FramedRead<TcpStream, LengthDelimitedCodec>, peer: SocketAddr) {
        while let Ok(Some(Ok(bytes))) = tokio::time::timeout(self.poll_interval, frames.next()).await {
            self.handle(&bytes, peer);
        }
    }

    fn handle(&mut self, bytes: &[u8], peer: SocketAddr) {
        let frame = match wire::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%peer, frame = ?e.frame_type(), error = %e, "could not decode frame");
                self.stats.rejected += 1;
                return;
            }
        };
        let applied = match frame {
            Frame::SetPixel { index, color } => self.screen.set_pixel(index, color),
            Frame::Render => self.screen.render(),
            Frame::Clear => self.screen.clear(),
            Frame::Fill { color } => self.screen.fill(color),
            other => {
                tracing::warn!(%peer, frame = ?other.frame_type(), "relay does not handle frame");
                self.stats.rejected += 1;
                return;
            }
        };
        match applied {
            Ok(()) => self.stats.handled += 1,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "screen rejected frame");
                self.stats.rejected += 1;
            }
        }
    }
}
