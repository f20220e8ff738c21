//! Choosing and driving a transport for a request.
//!
//! [`Transports`] bundles the shared datagram sockets with the registry and
//! request table and implements the transport decision: UDP first, TCP
//! first, or one falling back to the other, plus the retry of truncated
//! UDP responses over TCP at the same server.

use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};
use crate::base::iana::Rtype;
use crate::base::message::{Message, QueryBuilder};
use crate::dgram::DgramMux;
use crate::error::{Error, ResolutionError};
use crate::pending::PendingRequests;
use crate::registry::{GatePass, Registry, ServerEntry, TcpState};
use crate::stream;

/// How a single exchange is to be carried out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Plan {
    UdpOnly,
    TcpOnly,
    UdpThenTcp,
    TcpThenUdp,
}

/// The protocol of a single attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Proto {
    Udp,
    Tcp,
}

//------------ Transports ----------------------------------------------------

/// Everything needed to move a question to a server and back.
#[derive(Debug)]
pub struct Transports {
    registry: Arc<Registry>,
    pending: Arc<Mutex<PendingRequests>>,
    mux: DgramMux,
}

impl Transports {
    /// Creates the bundle.
    pub fn new(
        registry: Arc<Registry>,
        pending: Arc<Mutex<PendingRequests>>,
        mux: DgramMux,
    ) -> Self {
        Transports {
            registry,
            pending,
            mux,
        }
    }

    /// Returns whether IPv6 servers can be reached.
    pub fn have_v6(&self) -> bool {
        self.mux.have_v6()
    }

    /// Sends one question to one server and awaits the decoded response.
    pub async fn exchange(
        &self,
        entry: &Arc<ServerEntry>,
        name: &str,
        rtype: Rtype,
        budget: Duration,
    ) -> Result<Message, Error> {
        let protocols = entry.protocols();
        let tcp_failed = self.registry.tcp_failed(entry.addr());
        let plan = if !protocols.tcp() {
            Plan::UdpOnly
        } else if !protocols.udp() {
            Plan::TcpOnly
        } else if tcp_failed {
            Plan::UdpOnly
        } else if entry.tcp_established() {
            Plan::TcpThenUdp
        } else {
            Plan::UdpThenTcp
        };
        trace!(
            "querying {} for {} {} ({:?})",
            entry.addr(),
            name,
            rtype,
            plan
        );

        match plan {
            Plan::UdpOnly => {
                // Without TCP there is nothing to do about truncation;
                // the truncated response is all the caller gets.
                self.request_once(entry, name, rtype, budget, Proto::Udp)
                    .await
            }
            Plan::TcpOnly => {
                let response = self
                    .request_once(entry, name, rtype, budget, Proto::Tcp)
                    .await?;
                if response.header().tc() {
                    return Err(Error::Resolution(
                        ResolutionError::Truncated,
                    ));
                }
                Ok(response)
            }
            Plan::UdpThenTcp => {
                match self
                    .request_once(entry, name, rtype, budget, Proto::Udp)
                    .await
                {
                    Ok(response) if response.header().tc() => {
                        self.retry_over_tcp(entry, name, rtype, budget)
                            .await
                    }
                    Ok(response) => {
                        // Warm up TCP in the background so a later
                        // truncated answer does not pay the connect.
                        if matches!(
                            *entry.tcp.lock().expect("poisoned"),
                            TcpState::None
                        ) {
                            stream::warm(
                                self.registry.clone(),
                                self.pending.clone(),
                                entry.clone(),
                            );
                        }
                        Ok(response)
                    }
                    Err(udp_err) => {
                        debug!(
                            "UDP to {} failed ({}), trying TCP",
                            entry.addr(),
                            udp_err
                        );
                        let response = self
                            .request_once(
                                entry, name, rtype, budget, Proto::Tcp,
                            )
                            .await?;
                        if response.header().tc() {
                            return Err(Error::Resolution(
                                ResolutionError::Truncated,
                            ));
                        }
                        Ok(response)
                    }
                }
            }
            Plan::TcpThenUdp => {
                match self
                    .request_once(entry, name, rtype, budget, Proto::Tcp)
                    .await
                {
                    Ok(response) if response.header().tc() => {
                        Err(Error::Resolution(ResolutionError::Truncated))
                    }
                    Ok(response) => Ok(response),
                    Err(tcp_err) => {
                        debug!(
                            "TCP to {} failed ({}), trying UDP",
                            entry.addr(),
                            tcp_err
                        );
                        self.request_once(
                            entry, name, rtype, budget, Proto::Udp,
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Retries a truncated UDP exchange over TCP at the same server.
    async fn retry_over_tcp(
        &self,
        entry: &Arc<ServerEntry>,
        name: &str,
        rtype: Rtype,
        budget: Duration,
    ) -> Result<Message, Error> {
        trace!("retrying {} {} over TCP after truncation", name, rtype);
        let response = self
            .request_once(entry, name, rtype, budget, Proto::Tcp)
            .await?;
        if response.header().tc() {
            return Err(Error::Resolution(ResolutionError::Truncated));
        }
        Ok(response)
    }

    /// Performs a single request over a single protocol.
    async fn request_once(
        &self,
        entry: &Arc<ServerEntry>,
        name: &str,
        rtype: Rtype,
        budget: Duration,
        proto: Proto,
    ) -> Result<Message, Error> {
        let (id, receiver) = self
            .pending
            .lock()
            .expect("poisoned")
            .insert(name, rtype, entry.addr())
            .ok_or(Error::Resolution(
                ResolutionError::TooManyRequests,
            ))?;
        entry.add_pending(id);

        let mut builder = QueryBuilder::new(id);
        builder.set_rd(true);
        builder.push_question(name, rtype);
        let frame = builder.finish();

        let mut held_probe = false;
        let work = async {
            match proto {
                Proto::Udp => {
                    if entry.pass_gate().await == GatePass::Probe {
                        held_probe = true;
                    }
                    self.mux.send(entry.addr(), frame).await?;
                }
                Proto::Tcp => {
                    stream::send_frame(
                        &self.registry,
                        &self.pending,
                        entry,
                        frame,
                    )
                    .await?;
                }
            }
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(Error::Resolution(
                    ResolutionError::ConnectionLost,
                )),
            }
        };

        let outcome = timeout(budget, work).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                self.abandon(entry, id, held_probe);
                Err(err)
            }
            Err(_) => {
                self.abandon(entry, id, held_probe);
                Err(Error::timeout(budget.as_millis() as u64))
            }
        }
    }

    /// Cleans up after a request that will not see its response.
    ///
    /// A response carrying the ID after this point finds it unknown and is
    /// discarded.
    fn abandon(
        &self,
        entry: &Arc<ServerEntry>,
        id: u16,
        held_probe: bool,
    ) {
        self.pending.lock().expect("poisoned").remove(id);
        entry.remove_pending(id);
        if held_probe {
            entry.probe_failed();
        }
    }
}
