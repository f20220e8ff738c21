//! The shared datagram sockets.
//!
//! A resolver owns at most two UDP sockets, one per address family, shared
//! by every request towards every server. Outbound packets go through a
//! per-family FIFO queue drained by a writer task; a reader task per socket
//! demultiplexes inbound datagrams back to the server entry matching the
//! peer address and completes the matching request. Failing to create the
//! IPv4 socket is fatal; without an IPv6 socket, IPv6 servers are simply
//! unreachable.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use crate::base::message::Message;
use crate::error::{Error, ResolutionError};
use crate::pending::PendingRequests;
use crate::registry::Registry;

/// Maximum size of an inbound datagram.
const RECV_SIZE: usize = 1024;

/// Depth of the per-family send queue.
const SEND_QUEUE_LEN: usize = 32;

//------------ DgramMux ------------------------------------------------------

/// The shared UDP sockets of a resolver.
#[derive(Debug)]
pub struct DgramMux {
    v4: DgramSocket,
    v6: Option<DgramSocket>,
}

/// One family's socket, reachable through its send queue.
#[derive(Debug)]
struct DgramSocket {
    queue: mpsc::Sender<(Vec<u8>, SocketAddr)>,
}

impl DgramMux {
    /// Binds the family sockets and spawns their reader and writer tasks.
    pub async fn bind(
        registry: Arc<Registry>,
        pending: Arc<Mutex<PendingRequests>>,
    ) -> Result<DgramMux, Error> {
        let v4 = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => {
                DgramSocket::start(socket, &registry, &pending)
            }
            Err(err) => return Err(Error::Socket(Arc::new(err))),
        };
        let v6 = match UdpSocket::bind(("::", 0)).await {
            Ok(socket) => {
                Some(DgramSocket::start(socket, &registry, &pending))
            }
            Err(err) => {
                debug!("no IPv6 socket, IPv6 servers unreachable: {}", err);
                None
            }
        };
        Ok(DgramMux { v4, v6 })
    }

    /// Returns whether IPv6 servers can be reached.
    pub fn have_v6(&self) -> bool {
        self.v6.is_some()
    }

    /// Queues a packet for `target`.
    pub async fn send(
        &self,
        target: SocketAddr,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let socket = match target {
            SocketAddr::V4(_) => &self.v4,
            SocketAddr::V6(_) => self.v6.as_ref().ok_or_else(|| {
                Error::Socket(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no IPv6 socket",
                )))
            })?,
        };
        socket
            .queue
            .send((data, target))
            .await
            .map_err(|_| {
                Error::Resolution(ResolutionError::ConnectionLost)
            })
    }
}

impl DgramSocket {
    /// Wraps a bound socket, spawning its writer and reader.
    fn start(
        socket: UdpSocket,
        registry: &Arc<Registry>,
        pending: &Arc<Mutex<PendingRequests>>,
    ) -> DgramSocket {
        let socket = Arc::new(socket);
        let (queue, rx) = mpsc::channel(SEND_QUEUE_LEN);
        tokio::spawn(run_writer(socket.clone(), rx));
        tokio::spawn(run_reader(
            socket,
            registry.clone(),
            pending.clone(),
        ));
        DgramSocket { queue }
    }
}

/// Drains the send queue in order.
async fn run_writer(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((data, target)) = queue.recv().await {
        if let Err(err) = socket.send_to(&data, target).await {
            // The request runs into its timeout; nothing else to do here.
            debug!("UDP send to {} failed: {}", target, err);
        }
    }
}

/// Reads datagrams and hands them to the originating server's requests.
async fn run_reader(
    socket: Arc<UdpSocket>,
    registry: Arc<Registry>,
    pending: Arc<Mutex<PendingRequests>>,
) {
    let mut buf = vec![0u8; RECV_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(err) => {
                debug!("UDP receive failed: {}", err);
                continue;
            }
        };
        let Some(entry) = registry.lookup(peer) else {
            trace!("dropping datagram from unknown peer {}", peer);
            continue;
        };
        let message =
            match Message::from_octets(Bytes::copy_from_slice(&buf[..len]))
            {
                Ok(message) => message,
                Err(err) => {
                    debug!("bad datagram from {}: {}", peer, err);
                    registry.unload(
                        peer,
                        Some(Error::Resolution(
                            ResolutionError::MalformedResponse,
                        )),
                    );
                    continue;
                }
            };
        if !message.header().qr() {
            registry.unload(
                peer,
                Some(Error::Resolution(ResolutionError::NotAResponse)),
            );
            continue;
        }
        // The server answered; the first-contact gate opens for good.
        entry.mark_proven();
        let id = message.header().id();
        if pending
            .lock()
            .expect("poisoned")
            .complete(id, peer, Ok(message))
        {
            entry.remove_pending(id);
        }
    }
}
