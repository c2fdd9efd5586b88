mod actor;

use self::actor::Relay;
use crate::screen::Screen;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Frames handled by a relay over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub handled: u64,
    pub rejected: u64,
}

/// Handle to a relay bound to its own local endpoint.
///
/// The job connects over TCP and writes length-prefixed frames. Decoded
/// drawing frames are applied to the screen in the order they were written.
/// Dropping the handle stops the relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<RelayStats>>,
}

impl RelayHandle {
    /// Bind a fresh port on `host` and start relaying.
    pub async fn bind(
        host: &str,
        screen: Arc<dyn Screen>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let local_addr = listener.local_addr()?;
        let (stop, stop_rx) = watch::channel(false);
        let task = Relay::spawn(listener, screen, poll_interval, stop_rx);
        tracing::debug!(%local_addr, "relay listening");
        Ok(Self {
            local_addr,
            stop,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the relay to stop. Calling this more than once has no effect.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop the relay and wait for its loop to exit, releasing the port.
    /// Frames the job wrote before the stop are still applied.
    pub async fn join(mut self) -> RelayStats {
        self.stop();
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "relay task ended abnormally");
                RelayStats::default()
            }),
            None => RelayStats::default(),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
