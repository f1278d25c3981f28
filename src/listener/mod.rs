pub mod queue;

use crate::config::types::ListenerConfig;
use queue::{DropOldestQueue, PushOutcome};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65_535;
/// Log a warning on the first eviction and then every this many
const DROP_LOG_EVERY: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TextQueue = DropOldestQueue<String>;

/// Receives datagrams on one UDP port and hands their text to a drop-oldest queue.
pub struct UdpListener {
    local_addr: SocketAddr,
    queue: Arc<TextQueue>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpListener {
    /// Bind and start the receive loop. Cancelling `cancel` stops it.
    pub async fn start(config: &ListenerConfig, cancel: CancellationToken) -> Result<Self, ListenerError> {
        let addr = config.bind_addr();
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ListenerError::Bind { addr: addr.clone(), source })?;
        let local_addr = socket.local_addr()?;

        let queue = Arc::new(DropOldestQueue::new(config.queue_capacity));
        let running = Arc::new(AtomicBool::new(true));

        info!(addr = %local_addr, capacity = config.queue_capacity, "UDP listener started");

        let handle = tokio::spawn(receive_loop(
            socket,
            queue.clone(),
            running.clone(),
            cancel.clone(),
            config.retry_delay,
        ));

        Ok(Self {
            local_addr,
            queue,
            running,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue of received payloads; completes after the listener stops.
    pub fn receiver(&self) -> Arc<TextQueue> {
        self.queue.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "UDP listener task ended abnormally");
            }
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    queue: Arc<TextQueue>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    retry_delay: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((0, _)) => continue,
                Ok((len, peer)) => {
                    let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                    if queue.push(text) == PushOutcome::DroppedOldest {
                        let dropped = queue.dropped();
                        if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                            warn!(dropped, capacity = queue.capacity(), "Listener queue full, dropping oldest messages");
                        }
                    }
                    debug!(%peer, bytes = len, "Datagram received");
                }
                Err(e) => {
                    warn!(error = %e, delay = ?retry_delay, "UDP receive failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    queue.close();
    info!(dropped = queue.dropped(), "UDP listener stopped");
}
