//! The static host table.
//!
//! The table maps lowercased host names to textual addresses, one map per
//! address family. Producing the table, typically by parsing an
//! `/etc/hosts`-style file, is the business of a [`HostsLoader`]
//! implementation; the resolver only consumes the result and re-requests it
//! when the loader's version stamp advances or a caller forces a reload.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use crate::base::iana::Rtype;

//------------ HostsTable ----------------------------------------------------

/// A snapshot of static host data.
#[derive(Clone, Debug, Default)]
pub struct HostsTable {
    v4: HashMap<String, String>,
    v6: HashMap<String, String>,
}

impl HostsTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Maps a host name to an IPv4 address.
    pub fn insert_v4(
        &mut self,
        name: impl AsRef<str>,
        addr: impl Into<String>,
    ) {
        self.v4
            .insert(name.as_ref().to_ascii_lowercase(), addr.into());
    }

    /// Maps a host name to an IPv6 address.
    pub fn insert_v6(
        &mut self,
        name: impl AsRef<str>,
        addr: impl Into<String>,
    ) {
        self.v6
            .insert(name.as_ref().to_ascii_lowercase(), addr.into());
    }

    /// Looks up the address of `name` for an address record type.
    ///
    /// The name must already be lowercased. Non-address types never match.
    pub fn lookup(&self, name: &str, rtype: Rtype) -> Option<&str> {
        let map = match rtype {
            Rtype::A => &self.v4,
            Rtype::AAAA => &self.v6,
            _ => return None,
        };
        map.get(name).map(String::as_str)
    }

    /// Makes sure `localhost` resolves.
    ///
    /// Windows ships without a hosts entry for localhost, so the resolver
    /// injects one there: the IPv4 address from a system lookup and `::1`
    /// for IPv6.
    pub fn ensure_localhost(&mut self) {
        if self.v4.contains_key("localhost")
            || self.v6.contains_key("localhost")
        {
            return;
        }
        let v4 = system_localhost_v4()
            .unwrap_or_else(|| "127.0.0.1".into());
        self.v4.insert("localhost".into(), v4);
        self.v6.insert("localhost".into(), "::1".into());
    }
}

/// Asks the system for the IPv4 address of localhost.
fn system_localhost_v4() -> Option<String> {
    use std::net::ToSocketAddrs;

    ("localhost", 0)
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip().to_string())
}

//------------ HostsLoader ---------------------------------------------------

/// A producer of static host data.
pub trait HostsLoader: Send + Sync {
    /// Loads the host table.
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<HostsTable>> + Send + '_>>;

    /// A stamp that advances whenever the underlying data changes.
    ///
    /// File-backed implementations derive this from the modification
    /// time. The default never changes, so the table is loaded once.
    fn version(&self) -> u64 {
        0
    }
}

//------------ StaticHosts ---------------------------------------------------

/// A loader serving a fixed table.
#[derive(Clone, Debug, Default)]
pub struct StaticHosts {
    table: HostsTable,
}

impl StaticHosts {
    /// Creates a loader that always returns `table`.
    pub fn new(table: HostsTable) -> Self {
        StaticHosts { table }
    }
}

impl HostsLoader for StaticHosts {
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<HostsTable>> + Send + '_>>
    {
        let table = self.table.clone();
        Box::pin(async move { Ok(table) })
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_per_family_and_lowercased() {
        let mut table = HostsTable::new();
        table.insert_v4("Foo.Example", "192.168.1.1");
        table.insert_v6("foo.example", "fd00::1");

        assert_eq!(
            table.lookup("foo.example", Rtype::A),
            Some("192.168.1.1")
        );
        assert_eq!(
            table.lookup("foo.example", Rtype::AAAA),
            Some("fd00::1")
        );
        assert_eq!(table.lookup("foo.example", Rtype::CNAME), None);
        assert_eq!(table.lookup("bar.example", Rtype::A), None);
    }

    #[test]
    fn localhost_injection_is_idempotent() {
        let mut table = HostsTable::new();
        table.ensure_localhost();
        assert!(table.lookup("localhost", Rtype::A).is_some());
        assert_eq!(table.lookup("localhost", Rtype::AAAA), Some("::1"));

        let mut custom = HostsTable::new();
        custom.insert_v4("localhost", "10.0.0.53");
        custom.ensure_localhost();
        assert_eq!(
            custom.lookup("localhost", Rtype::A),
            Some("10.0.0.53")
        );
    }
}
