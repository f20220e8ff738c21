//! Per-server bookkeeping.
//!
//! The registry holds one [`ServerEntry`] per upstream endpoint currently in
//! use. Entries come into being on first use and go away when their socket
//! fails or when they have sat idle past [`IDLE_TIMEOUT`]; a once-a-second
//! sweeper collects the idle ones and parks itself while no servers are
//! loaded. The fact that TCP failed towards a server outlives its entry so
//! an endpoint does not get a fresh TCP attempt every time it is reloaded.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, Instant};
use tracing::debug;
use crate::conf::Protocols;
use crate::error::{Error, ResolutionError};
use crate::pending::PendingRequests;

/// How long a server without pending requests stays loaded.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The cadence of the idle sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

//------------ TcpState ------------------------------------------------------

/// The state of a server's TCP connection.
#[derive(Debug, Default)]
pub enum TcpState {
    /// No connection has been attempted.
    #[default]
    None,

    /// A connect is in flight; waiters park on the notify.
    Connecting(Arc<Notify>),

    /// The connection is up; frames go to the writer.
    Established(mpsc::Sender<Vec<u8>>),

    /// The connect failed; the server is TCP-unusable.
    Failed,
}

//------------ GatePass ------------------------------------------------------

/// The outcome of passing the first-contact gate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GatePass {
    /// The server has already proven reachable; send away.
    Open,

    /// The caller holds the probe; it must report the probe's outcome.
    Probe,
}

/// First-contact gate state.
///
/// Until a server has answered once over UDP, only a single probe request
/// may be outstanding towards it. Everything else parks on the notify.
#[derive(Debug, Default)]
struct UdpGate {
    proven: bool,
    probing: bool,
}

//------------ ServerEntry ---------------------------------------------------

/// Resolver-side bookkeeping for one upstream endpoint.
#[derive(Debug)]
pub struct ServerEntry {
    addr: SocketAddr,
    protocols: Protocols,
    pub(crate) tcp: Mutex<TcpState>,
    gate: Mutex<UdpGate>,
    gate_notify: Notify,
    pending: Mutex<HashSet<u16>>,
    idle_expires: Mutex<Option<Instant>>,
}

impl ServerEntry {
    fn new(addr: SocketAddr, protocols: Protocols) -> Self {
        ServerEntry {
            addr,
            protocols,
            tcp: Mutex::new(TcpState::None),
            gate: Mutex::new(Default::default()),
            gate_notify: Notify::new(),
            pending: Mutex::new(HashSet::new()),
            idle_expires: Mutex::new(Some(
                Instant::now() + IDLE_TIMEOUT,
            )),
        }
    }

    /// Returns the server's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the protocols the server may be queried over.
    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    /// Returns whether a TCP connection is currently established.
    pub fn tcp_established(&self) -> bool {
        matches!(
            *self.tcp.lock().expect("poisoned"),
            TcpState::Established(_)
        )
    }

    /// Records a request as pending on this server.
    pub fn add_pending(&self, id: u16) {
        self.pending.lock().expect("poisoned").insert(id);
        *self.idle_expires.lock().expect("poisoned") = None;
    }

    /// Removes a request from the pending set.
    ///
    /// When the set drains the idle window starts.
    pub fn remove_pending(&self, id: u16) {
        let mut pending = self.pending.lock().expect("poisoned");
        pending.remove(&id);
        if pending.is_empty() {
            *self.idle_expires.lock().expect("poisoned") =
                Some(Instant::now() + IDLE_TIMEOUT);
        }
    }

    /// Returns whether the idle window has run out.
    fn idle_expired(&self, now: Instant) -> bool {
        self.pending.lock().expect("poisoned").is_empty()
            && self
                .idle_expires
                .lock()
                .expect("poisoned")
                .is_some_and(|at| at <= now)
    }

    /// Passes the first-contact gate.
    ///
    /// Returns immediately once the server has proven reachable. Otherwise
    /// at most one caller gets [`GatePass::Probe`] and everyone else waits
    /// for the probe to settle.
    pub async fn pass_gate(&self) -> GatePass {
        loop {
            let notified = self.gate_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut gate = self.gate.lock().expect("poisoned");
                if gate.proven {
                    return GatePass::Open;
                }
                if !gate.probing {
                    gate.probing = true;
                    return GatePass::Probe;
                }
            }
            notified.await;
        }
    }

    /// Marks the server as proven reachable, lifting the gate for good.
    pub fn mark_proven(&self) {
        let mut gate = self.gate.lock().expect("poisoned");
        if !gate.proven {
            gate.proven = true;
            gate.probing = false;
            self.gate_notify.notify_waiters();
        }
    }

    /// Reports a failed probe, letting the next waiter try.
    pub fn probe_failed(&self) {
        let mut gate = self.gate.lock().expect("poisoned");
        if !gate.proven && gate.probing {
            gate.probing = false;
            self.gate_notify.notify_waiters();
        }
    }
}

//------------ Registry ------------------------------------------------------

/// The set of loaded servers.
#[derive(Debug)]
pub struct Registry {
    servers: Mutex<HashMap<SocketAddr, Arc<ServerEntry>>>,
    tcp_failed: Mutex<HashSet<SocketAddr>>,
    pending: Arc<Mutex<PendingRequests>>,
    sweeper_running: Mutex<bool>,
    me: Weak<Registry>,
}

impl Registry {
    /// Creates an empty registry sharing the given request table.
    pub fn new(pending: Arc<Mutex<PendingRequests>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Registry {
            servers: Mutex::new(HashMap::new()),
            tcp_failed: Mutex::new(HashSet::new()),
            pending,
            sweeper_running: Mutex::new(false),
            me: me.clone(),
        })
    }

    /// Returns the entry for `addr`, loading it if necessary.
    pub fn get_or_load(
        &self,
        addr: SocketAddr,
        protocols: Protocols,
    ) -> Arc<ServerEntry> {
        let entry = {
            let mut servers = self.servers.lock().expect("poisoned");
            servers
                .entry(addr)
                .or_insert_with(|| {
                    Arc::new(ServerEntry::new(addr, protocols))
                })
                .clone()
        };
        self.ensure_sweeper();
        entry
    }

    /// Returns the entry for `addr` if it is loaded.
    pub fn lookup(&self, addr: SocketAddr) -> Option<Arc<ServerEntry>> {
        self.servers.lock().expect("poisoned").get(&addr).cloned()
    }

    /// Returns whether TCP has previously failed towards `addr`.
    pub fn tcp_failed(&self, addr: SocketAddr) -> bool {
        self.tcp_failed.lock().expect("poisoned").contains(&addr)
    }

    /// Records that TCP failed towards `addr`.
    ///
    /// The fact is sticky: it survives the entry being unloaded.
    pub fn mark_tcp_failed(&self, addr: SocketAddr) {
        self.tcp_failed.lock().expect("poisoned").insert(addr);
    }

    /// Unloads the server at `addr`.
    ///
    /// All requests pending on it fail with `error`, or with a generic
    /// connection-lost error when none is given. Parked gate waiters are
    /// released so they can run into their own timeouts instead of hanging.
    pub fn unload(&self, addr: SocketAddr, error: Option<Error>) {
        let entry = {
            let mut servers = self.servers.lock().expect("poisoned");
            servers.remove(&addr)
        };
        let Some(entry) = entry else {
            return;
        };
        debug!("unloading server {}", addr);
        *entry.tcp.lock().expect("poisoned") = TcpState::None;
        entry.mark_proven();
        let error = error.unwrap_or(Error::Resolution(
            ResolutionError::ConnectionLost,
        ));
        self.pending
            .lock()
            .expect("poisoned")
            .fail_server(addr, error);
    }

    /// Starts the idle sweeper unless it is already running.
    ///
    /// The sweeper scans loaded servers once a second and unloads any whose
    /// idle window has passed. It exits once the registry is empty and gets
    /// restarted by the next load.
    fn ensure_sweeper(&self) {
        {
            let mut running =
                self.sweeper_running.lock().expect("poisoned");
            if *running {
                return;
            }
            *running = true;
        }
        let Some(registry) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let now = Instant::now();
                let expired: Vec<SocketAddr> = registry
                    .servers
                    .lock()
                    .expect("poisoned")
                    .values()
                    .filter(|entry| entry.idle_expired(now))
                    .map(|entry| entry.addr())
                    .collect();
                for addr in expired {
                    registry.unload(addr, None);
                }
                let mut running =
                    registry.sweeper_running.lock().expect("poisoned");
                if registry.servers.lock().expect("poisoned").is_empty() {
                    *running = false;
                    return;
                }
            }
        });
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::iana::Rtype;

    fn registry() -> Arc<Registry> {
        Registry::new(Arc::new(Mutex::new(PendingRequests::new())))
    }

    fn addr() -> SocketAddr {
        "192.0.2.53:53".parse().unwrap()
    }

    #[tokio::test]
    async fn gate_admits_one_probe() {
        let registry = registry();
        let entry = registry.get_or_load(addr(), Protocols::ANY);
        assert_eq!(entry.pass_gate().await, GatePass::Probe);

        // A second caller parks until the probe settles.
        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.pass_gate().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        entry.mark_proven();
        assert_eq!(waiter.await.unwrap(), GatePass::Open);
        assert_eq!(entry.pass_gate().await, GatePass::Open);
    }

    #[tokio::test]
    async fn failed_probe_hands_the_gate_on() {
        let registry = registry();
        let entry = registry.get_or_load(addr(), Protocols::ANY);
        assert_eq!(entry.pass_gate().await, GatePass::Probe);
        entry.probe_failed();
        assert_eq!(entry.pass_gate().await, GatePass::Probe);
    }

    #[tokio::test]
    async fn unload_fails_pending_requests() {
        let pending = Arc::new(Mutex::new(PendingRequests::new()));
        let registry = Registry::new(pending.clone());
        let entry = registry.get_or_load(addr(), Protocols::ANY);

        let (id, rx) = pending
            .lock()
            .unwrap()
            .insert("a.example", Rtype::A, addr())
            .unwrap();
        entry.add_pending(id);

        registry.unload(addr(), None);
        assert!(registry.lookup(addr()).is_none());
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_servers_get_swept() {
        let registry = registry();
        let entry = registry.get_or_load(addr(), Protocols::ANY);
        entry.add_pending(7);
        entry.remove_pending(7);

        tokio::time::sleep(IDLE_TIMEOUT + Duration::from_secs(2)).await;
        assert!(registry.lookup(addr()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_servers_stay_loaded() {
        let registry = registry();
        let entry = registry.get_or_load(addr(), Protocols::ANY);
        entry.add_pending(7);

        tokio::time::sleep(IDLE_TIMEOUT + Duration::from_secs(2)).await;
        assert!(registry.lookup(addr()).is_some());
    }
}
