//! Gateway role: stream listener and event loop.
//!
//! One task owns the [`GatewayCore`]; per-connection reader tasks funnel
//! bytes into it over an mpsc channel and per-connection writer tasks drain
//! the outbound queues. No state is shared between tasks.

pub mod core;
pub mod registry;

use std::io;
use std::net::SocketAddr;

use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use self::core::{GatewayCore, GwEvent};
use self::registry::Handle;

/// The gateway network front end.
pub struct Gateway {
    listener: TcpListener,
    event_tx: mpsc::UnboundedSender<GwEvent>,
    event_rx: mpsc::UnboundedReceiver<GwEvent>,
    next_handle: Handle,
}

impl Gateway {
    /// Binds the stream listener.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("gateway listening on {}", listener.local_addr()?);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            event_tx,
            event_rx,
            next_handle: 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections and dispatches events until the process stops.
    pub async fn run(mut self) {
        let mut core = GatewayCore::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let handle = self.next_handle;
                            self.next_handle += 1;
                            debug!("accepted {} as handle {}", addr, handle);
                            self.spawn_connection(handle, stream);
                        }
                        Err(e) => {
                            // Fatal only for the listening socket itself.
                            error!("accept failed: {}", e);
                        }
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => core.handle_event(event),
                        None => break,
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, handle: Handle, stream: tokio::net::TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        if self
            .event_tx
            .send(GwEvent::Connected { handle, tx: out_tx })
            .is_err()
        {
            return;
        }

        tokio::spawn(connection_writer(handle, write_half, out_rx));
        tokio::spawn(connection_reader(handle, read_half, self.event_tx.clone()));
    }
}

/// Reads the stream into Data events until the peer goes away.
async fn connection_reader(
    handle: Handle,
    mut read_half: OwnedReadHalf,
    event_tx: mpsc::UnboundedSender<GwEvent>,
) {
    let mut buffer = [0u8; 1024];
    loop {
        match read_half.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let event = GwEvent::Data {
                    handle,
                    bytes: buffer[..n].to_vec(),
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("read error on handle {}: {}", handle, e);
                break;
            }
        }
    }
    let _ = event_tx.send(GwEvent::Closed { handle });
}

/// Drains the outbound queue into the socket. The queue sender being
/// dropped (peer eviction) closes the write half and thereby the stream.
async fn connection_writer(
    handle: Handle,
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = out_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            debug!("write error on handle {}: {}", handle, e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
