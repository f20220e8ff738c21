//! The per-server stream transport.
//!
//! A server's TCP connection is opened lazily by the first request that
//! needs it and multiplexes every outstanding request towards that server
//! over the single stream, with the standard two-octet big-endian length
//! prefix in both directions. The connection dying in any way fails all
//! requests pending on the server and unloads it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};
use crate::base::message::Message;
use crate::error::{Error, ResolutionError};
use crate::pending::PendingRequests;
use crate::registry::{Registry, ServerEntry, TcpState};

/// How long a connect may take before the server counts as TCP-unusable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of the frame write queue.
const WRITE_QUEUE_LEN: usize = 8;

/// Capacity of the private channel dispatching inbound messages.
const REPLY_CHAN_CAP: usize = 8;

//------------ Sending -------------------------------------------------------

/// Sends one encoded message to `entry` over TCP, connecting lazily.
pub async fn send_frame(
    registry: &Arc<Registry>,
    pending: &Arc<Mutex<PendingRequests>>,
    entry: &Arc<ServerEntry>,
    frame: Vec<u8>,
) -> Result<(), Error> {
    let sender = ensure_connected(registry, pending, entry, true).await?;
    let mut data = Vec::with_capacity(2 + frame.len());
    data.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    data.extend_from_slice(&frame);
    sender.send(data).await.map_err(|_| {
        Error::Resolution(ResolutionError::ConnectionLost)
    })
}

/// Starts a background connect so future requests find TCP ready.
pub fn warm(
    registry: Arc<Registry>,
    pending: Arc<Mutex<PendingRequests>>,
    entry: Arc<ServerEntry>,
) {
    tokio::spawn(async move {
        let _ = ensure_connected(&registry, &pending, &entry, false).await;
    });
}

/// Returns the write queue of the server's established connection.
///
/// At most one caller performs the actual connect; everyone else parks
/// until it settles. A connect failure or timeout is sticky; when a
/// request is actually waiting on the connect (`on_demand`) it also
/// unloads the server. A failed background warm-up must not do that, it
/// would tear down requests that are happily using UDP.
async fn ensure_connected(
    registry: &Arc<Registry>,
    pending: &Arc<Mutex<PendingRequests>>,
    entry: &Arc<ServerEntry>,
    on_demand: bool,
) -> Result<mpsc::Sender<Vec<u8>>, Error> {
    loop {
        let parked = {
            let mut state = entry.tcp.lock().expect("poisoned");
            let parked = match &*state {
                TcpState::Established(sender) => {
                    return Ok(sender.clone())
                }
                TcpState::Failed => {
                    return Err(Error::Resolution(
                        ResolutionError::ConnectFailed,
                    ))
                }
                TcpState::Connecting(notify) => Some(notify.clone()),
                TcpState::None => None,
            };
            match parked {
                Some(notify) => notify,
                None => {
                    *state = TcpState::Connecting(Arc::new(
                        tokio::sync::Notify::new(),
                    ));
                    break;
                }
            }
        };
        let notified = parked.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if matches!(
            *entry.tcp.lock().expect("poisoned"),
            TcpState::Connecting(_)
        ) {
            notified.await;
        }
    }

    // This caller owns the connect attempt.
    let addr = entry.addr();
    trace!("connecting to {} over TCP", addr);
    let connected = match timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect(addr),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => {
            debug!("TCP connect to {} failed: {}", addr, err);
            Err(())
        }
        Err(_) => {
            debug!("TCP connect to {} timed out", addr);
            Err(())
        }
    };

    match connected {
        Ok(stream) => {
            let (sender, frames) = mpsc::channel(WRITE_QUEUE_LEN);
            let notify = {
                let mut state = entry.tcp.lock().expect("poisoned");
                let notify = match std::mem::take(&mut *state) {
                    TcpState::Connecting(notify) => Some(notify),
                    _ => None,
                };
                *state = TcpState::Established(sender.clone());
                notify
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
            tokio::spawn(run(
                stream,
                frames,
                registry.clone(),
                pending.clone(),
                addr,
            ));
            Ok(sender)
        }
        Err(()) => {
            let notify = {
                let mut state = entry.tcp.lock().expect("poisoned");
                let notify = match std::mem::take(&mut *state) {
                    TcpState::Connecting(notify) => Some(notify),
                    _ => None,
                };
                *state = TcpState::Failed;
                notify
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
            registry.mark_tcp_failed(addr);
            if on_demand {
                registry.unload(
                    addr,
                    Some(Error::Resolution(
                        ResolutionError::ConnectFailed,
                    )),
                );
            }
            Err(Error::Resolution(ResolutionError::ConnectFailed))
        }
    }
}

//------------ Connection machinery ------------------------------------------

/// Drives an established connection.
///
/// Ends when the entry is unloaded (all frame senders dropped) or on any
/// stream error, in which case the server is unloaded with the error.
async fn run(
    stream: TcpStream,
    mut frames: mpsc::Receiver<Vec<u8>>,
    registry: Arc<Registry>,
    pending: Arc<Mutex<PendingRequests>>,
    addr: SocketAddr,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (reply_tx, mut reply_rx) = mpsc::channel(REPLY_CHAN_CAP);
    let reader_fut = reader(read_half, reply_tx);
    tokio::pin!(reader_fut);

    loop {
        tokio::select! {
            biased;
            error = &mut reader_fut => {
                registry.unload(addr, Some(error));
                return;
            }
            reply = reply_rx.recv() => {
                let Some(message) = reply else { return };
                if !message.header().qr() {
                    registry.unload(
                        addr,
                        Some(Error::Resolution(
                            ResolutionError::NotAResponse,
                        )),
                    );
                    return;
                }
                let id = message.header().id();
                if pending
                    .lock()
                    .expect("poisoned")
                    .complete(id, addr, Ok(message))
                {
                    if let Some(entry) = registry.lookup(addr) {
                        entry.remove_pending(id);
                    }
                }
            }
            frame = frames.recv() => {
                let Some(data) = frame else {
                    // The server was unloaded; wind the connection down.
                    let _ = write_half.shutdown().await;
                    return;
                };
                if let Err(err) = write_half.write_all(&data).await {
                    registry.unload(
                        addr,
                        Some(Error::Resolution(err.into())),
                    );
                    return;
                }
            }
        }
    }
}

/// Reads length-prefixed messages off the stream until something breaks.
///
/// The connection closing, even cleanly, is an error up here: requests may
/// still be outstanding and a server that hangs up on them is gone.
async fn reader(
    mut sock: ReadHalf<TcpStream>,
    sender: mpsc::Sender<Message>,
) -> Error {
    loop {
        let len = match sock.read_u16().await {
            Ok(len) => len as usize,
            Err(_) => {
                return Error::Resolution(ResolutionError::ConnectionLost)
            }
        };
        let mut buf = vec![0u8; len];
        if sock.read_exact(&mut buf).await.is_err() {
            return Error::Resolution(ResolutionError::ConnectionLost);
        }
        match Message::from_octets(Bytes::from(buf)) {
            Ok(message) => {
                if sender.send(message).await.is_err() {
                    return Error::Resolution(
                        ResolutionError::ConnectionLost,
                    );
                }
            }
            Err(err) => {
                debug!("bad frame on stream: {}", err);
                return Error::Resolution(
                    ResolutionError::MalformedResponse,
                );
            }
        }
    }
}
