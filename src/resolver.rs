//! The resolver.
//!
//! [`Resolver`] collects everything needed to run lookups: the collaborator
//! contracts for cache, system configuration, and host data, plus the
//! shared sockets and per-server bookkeeping. Values clone cheaply, all
//! state sits behind an arc, and one resolver can serve any number of
//! concurrent lookups.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use crate::answer::Answer;
use crate::base::iana::Rtype;
use crate::cache::{Cache, MemoryCache};
use crate::coalesce::Coalescer;
use crate::conf::{parse_nameserver, ConfLoader, ServerConf, StaticConf};
use crate::dgram::DgramMux;
use crate::error::Error;
use crate::hosts::{HostsLoader, HostsTable, StaticHosts};
use crate::pending::PendingRequests;
use crate::registry::Registry;
use crate::transport::Transports;

//------------ ResolveOptions ------------------------------------------------

/// Options for [`Resolver::resolve`].
#[derive(Clone, Debug)]
pub struct ResolveOptions {
    /// The record types to resolve; empty means both A and AAAA.
    pub types: Vec<Rtype>,

    /// Query this server instead of the configured ones.
    ///
    /// The string has the form `[scheme://]host[:port]` with `udp` or
    /// `tcp` as the scheme; no scheme allows both protocols.
    pub server: Option<String>,

    /// Per-request timeout, overriding the configured one.
    pub timeout: Option<Duration>,

    /// Whether the static host table is consulted.
    pub hosts: bool,

    /// Whether the cache is consulted and populated.
    pub cache: bool,

    /// Force a re-read of the host data before this lookup.
    pub reload_hosts: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            types: Vec::new(),
            server: None,
            timeout: None,
            hosts: true,
            cache: true,
            reload_hosts: false,
        }
    }
}

//------------ QueryOptions --------------------------------------------------

/// Options for [`Resolver::query`].
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Query this server instead of the configured ones.
    pub server: Option<String>,

    /// Per-request timeout, overriding the configured one.
    pub timeout: Option<Duration>,

    /// Whether the static host table is consulted.
    pub hosts: bool,

    /// Whether the cache is consulted and populated.
    pub cache: bool,

    /// Force a re-read of the host data before this lookup.
    pub reload_hosts: bool,

    /// Whether CNAME and DNAME chains are followed.
    pub recurse: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            server: None,
            timeout: None,
            hosts: true,
            cache: true,
            reload_hosts: false,
            recurse: false,
        }
    }
}

//------------ Resolver ------------------------------------------------------

/// An asynchronous DNS stub resolver.
///
/// A lookup consults the static host table and the answer cache before
/// turning to the configured recursive servers over UDP, falling back to
/// TCP on errors and truncation. Identical concurrent lookups share one
/// upstream exchange.
///
/// The plain [`new`][Resolver::new] constructor wires up the default
/// collaborators: an in-memory cache and a static fallback configuration.
/// Use the [`builder`][Resolver::builder] to plug in your own cache
/// backend, configuration discovery, or host data.
#[derive(Clone)]
pub struct Resolver {
    core: Arc<Core>,
}

impl Resolver {
    /// Creates a resolver with default collaborators.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a builder for a customized resolver.
    pub fn builder() -> Builder {
        Default::default()
    }

    /// Resolves a host name into its addresses.
    ///
    /// Returns the answers for the requested address types in request
    /// order. IP literals are answered synthetically, invalid names fail
    /// with [`Error::InvalidName`] before anything else happens, and
    /// requesting types other than A or AAAA fails with
    /// [`Error::InvalidType`].
    pub async fn resolve(
        &self,
        name: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<Answer>, Error> {
        self.core.resolve(name, options).await
    }

    /// Queries a single record type.
    ///
    /// This is the low-level path: any type goes, nothing is coalesced,
    /// and alias chains are only chased when `options.recurse` says so.
    pub async fn query(
        &self,
        name: &str,
        rtype: Rtype,
        options: &QueryOptions,
    ) -> Result<Vec<Answer>, Error> {
        self.core.query(name, rtype, options).await
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

//------------ Builder -------------------------------------------------------

/// Builds a [`Resolver`] with hand-picked collaborators.
#[derive(Default)]
pub struct Builder {
    cache: Option<Arc<dyn Cache>>,
    conf_loader: Option<Arc<dyn ConfLoader>>,
    hosts_loader: Option<Arc<dyn HostsLoader>>,
}

impl Builder {
    /// Uses the given cache backend.
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses the given system configuration discovery.
    pub fn conf_loader(mut self, loader: Arc<dyn ConfLoader>) -> Self {
        self.conf_loader = Some(loader);
        self
    }

    /// Uses the given host data producer.
    pub fn hosts_loader(mut self, loader: Arc<dyn HostsLoader>) -> Self {
        self.hosts_loader = Some(loader);
        self
    }

    /// Finishes the resolver.
    pub fn build(self) -> Resolver {
        let pending = Arc::new(Mutex::new(PendingRequests::new()));
        let registry = Registry::new(pending.clone());
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let conf_loader = self
            .conf_loader
            .unwrap_or_else(|| Arc::new(StaticConf::default()));
        let hosts_loader = self
            .hosts_loader
            .unwrap_or_else(|| Arc::new(StaticHosts::default()));
        Resolver {
            core: Arc::new_cyclic(|me| Core {
                cache,
                conf_loader,
                hosts_loader,
                coalescer: Arc::new(Coalescer::new()),
                registry,
                pending,
                transports: OnceCell::new(),
                conf: OnceCell::new(),
                hosts: Mutex::new(None),
                me: me.clone(),
            }),
        }
    }
}

//------------ Core ----------------------------------------------------------

/// The shared innards of a resolver.
pub(crate) struct Core {
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) conf_loader: Arc<dyn ConfLoader>,
    pub(crate) hosts_loader: Arc<dyn HostsLoader>,
    pub(crate) coalescer: Arc<Coalescer>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pending: Arc<Mutex<PendingRequests>>,
    transports: OnceCell<Transports>,
    conf: OnceCell<ResolvedConf>,
    hosts: Mutex<Option<(u64, Arc<HostsTable>)>>,
    me: Weak<Core>,
}

/// The memoized outcome of system configuration discovery.
pub(crate) struct ResolvedConf {
    pub(crate) servers: Vec<ServerConf>,
    pub(crate) timeout: Duration,
    pub(crate) attempts: usize,
}

impl Core {
    /// Returns an owning handle to this core.
    ///
    /// The weak self-reference always upgrades while a method runs, since
    /// every call path goes through an arc.
    pub(crate) fn arc(&self) -> Arc<Core> {
        self.me.upgrade().expect("core is alive")
    }

    /// Returns the transports, binding the sockets on first use.
    pub(crate) async fn transports(&self) -> Result<&Transports, Error> {
        self.transports
            .get_or_try_init(|| async move {
                let mux = DgramMux::bind(
                    self.registry.clone(),
                    self.pending.clone(),
                )
                .await?;
                Ok(Transports::new(
                    self.registry.clone(),
                    self.pending.clone(),
                    mux,
                ))
            })
            .await
    }

    /// Returns the system configuration, loading it on first need.
    ///
    /// Concurrent first callers share a single in-flight load. Name server
    /// entries that do not parse are dropped with a warning, as are IPv6
    /// servers when no IPv6 socket could be had.
    pub(crate) async fn system_conf(
        &self,
    ) -> Result<&ResolvedConf, Error> {
        let have_v6 = self.transports().await?.have_v6();
        Ok(self
            .conf
            .get_or_init(|| async move {
                let conf = self.conf_loader.load().await;
                let mut servers = Vec::new();
                for entry in &conf.nameservers {
                    match parse_nameserver(entry) {
                        Ok(addr) => {
                            if addr.is_ipv6() && !have_v6 {
                                debug!(
                                    "skipping IPv6 nameserver {}",
                                    entry
                                );
                                continue;
                            }
                            servers.push(ServerConf::new(addr));
                        }
                        Err(_) => {
                            warn!(
                                "ignoring invalid nameserver {:?}",
                                entry
                            );
                        }
                    }
                }
                ResolvedConf {
                    servers,
                    timeout: conf.timeout,
                    attempts: conf.attempts,
                }
            })
            .await)
    }

    /// Returns the host table, loading or re-loading it as needed.
    ///
    /// A load happens on first use, when the loader's version stamp has
    /// advanced, or when the caller forces it. A failing load logs and
    /// acts as an empty table without clobbering older data.
    pub(crate) async fn hosts_table(&self, reload: bool) -> Arc<HostsTable> {
        let version = self.hosts_loader.version();
        if !reload {
            if let Some((cached_version, table)) =
                self.hosts.lock().expect("poisoned").as_ref()
            {
                if *cached_version == version {
                    return table.clone();
                }
            }
        }
        match self.hosts_loader.load().await {
            Ok(mut table) => {
                if cfg!(windows) {
                    table.ensure_localhost();
                }
                let table = Arc::new(table);
                *self.hosts.lock().expect("poisoned") =
                    Some((version, table.clone()));
                table
            }
            Err(err) => {
                warn!("failed to load host table: {}", err);
                Arc::new(HostsTable::new())
            }
        }
    }
}
