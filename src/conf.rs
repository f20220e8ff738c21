//! Resolver configuration.
//!
//! There are two parts to this module: the [`SystemConf`] data produced by a
//! [`ConfLoader`] (normally discovered from `/etc/resolv.conf` or a platform
//! registry by an implementation outside this crate), and the parsing of
//! caller-supplied server overrides into a [`ServerConf`].

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use crate::error::{Error, ResolutionError};

/// The timeout used when the configuration does not provide one.
pub const DEF_TIMEOUT: Duration = Duration::from_millis(3000);

/// The number of upstream walk attempts used by default.
pub const DEF_ATTEMPTS: usize = 2;

/// The port queries go to when none is configured.
pub const DEF_PORT: u16 = 53;

//------------ SystemConf ----------------------------------------------------

/// System resolver configuration.
///
/// The name servers are kept as strings of the `host[:port]` form; hosts
/// must be IP addresses since a stub resolver cannot resolve its own
/// upstreams.
#[derive(Clone, Debug)]
pub struct SystemConf {
    /// The name servers to query, in order of preference.
    pub nameservers: Vec<String>,

    /// Timeout for a single request.
    pub timeout: Duration,

    /// Number of times the server list is walked before giving up.
    pub attempts: usize,
}

impl Default for SystemConf {
    fn default() -> Self {
        SystemConf {
            nameservers: vec!["8.8.8.8:53".into(), "8.8.4.4:53".into()],
            timeout: DEF_TIMEOUT,
            attempts: DEF_ATTEMPTS,
        }
    }
}

//------------ ConfLoader ----------------------------------------------------

/// System configuration discovery.
///
/// Loading is infallible: implementations fall back to
/// `SystemConf::default()` when discovery fails. The resolver triggers the
/// load on first upstream need, memoizes the result, and shares a single
/// in-flight load between concurrent callers.
pub trait ConfLoader: Send + Sync {
    /// Loads the system configuration.
    fn load(&self)
        -> Pin<Box<dyn Future<Output = SystemConf> + Send + '_>>;
}

//------------ StaticConf ----------------------------------------------------

/// A configuration loader returning a fixed configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticConf {
    conf: SystemConf,
}

impl StaticConf {
    /// Creates a loader that always returns `conf`.
    pub fn new(conf: SystemConf) -> Self {
        StaticConf { conf }
    }
}

impl ConfLoader for StaticConf {
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = SystemConf> + Send + '_>> {
        let conf = self.conf.clone();
        Box::pin(async move { conf })
    }
}

//------------ Protocols -----------------------------------------------------

/// The transport protocols a server may be queried over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Protocols {
    udp: bool,
    tcp: bool,
}

impl Protocols {
    /// Both UDP and TCP are allowed.
    pub const ANY: Protocols = Protocols {
        udp: true,
        tcp: true,
    };

    /// Only UDP is allowed.
    pub const UDP: Protocols = Protocols {
        udp: true,
        tcp: false,
    };

    /// Only TCP is allowed.
    pub const TCP: Protocols = Protocols {
        udp: false,
        tcp: true,
    };

    /// Returns whether UDP is allowed.
    pub fn udp(self) -> bool {
        self.udp
    }

    /// Returns whether TCP is allowed.
    pub fn tcp(self) -> bool {
        self.tcp
    }
}

//------------ ServerConf ----------------------------------------------------

/// A single upstream server target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerConf {
    /// The server's address.
    pub addr: SocketAddr,

    /// The protocols the server may be queried over.
    pub protocols: Protocols,
}

impl ServerConf {
    /// Creates a server target from an address, allowing both protocols.
    pub fn new(addr: SocketAddr) -> Self {
        ServerConf {
            addr,
            protocols: Protocols::ANY,
        }
    }

    /// Parses a caller-supplied `[scheme://]host[:port]` server string.
    ///
    /// A `udp://` scheme restricts the server to UDP, `tcp://` restricts it
    /// to TCP, no scheme allows both. The port defaults to 53. IPv6 hosts
    /// need brackets when a port is given.
    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::Resolution(ResolutionError::InvalidServer(uri.into()))
        };
        let (protocols, rest) = if let Some(rest) = uri.strip_prefix("udp://")
        {
            (Protocols::UDP, rest)
        } else if let Some(rest) = uri.strip_prefix("tcp://") {
            (Protocols::TCP, rest)
        } else if uri.contains("://") {
            return Err(invalid());
        } else {
            (Protocols::ANY, uri)
        };

        let (host, port) = split_host_port(rest).ok_or_else(invalid)?;
        let addr = host.parse::<IpAddr>().map_err(|_| invalid())?;
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEF_PORT,
        };
        Ok(ServerConf {
            addr: SocketAddr::new(addr, port),
            protocols,
        })
    }
}

/// Splits `host[:port]`, honouring IPv6 brackets.
fn split_host_port(input: &str) -> Option<(&str, Option<&str>)> {
    if input.is_empty() {
        return None;
    }
    if let Some(rest) = input.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        return match rest.strip_prefix(':') {
            Some(port) => Some((host, Some(port))),
            None if rest.is_empty() => Some((host, None)),
            None => None,
        };
    }
    // More than one colon without brackets can only be a bare IPv6 address.
    if input.matches(':').count() > 1 {
        return Some((input, None));
    }
    match input.split_once(':') {
        Some((host, port)) => Some((host, Some(port))),
        None => Some((input, None)),
    }
}

/// Parses a configured `host[:port]` name server entry.
pub fn parse_nameserver(entry: &str) -> Result<SocketAddr, Error> {
    let (host, port) = split_host_port(entry).ok_or_else(|| {
        Error::Resolution(ResolutionError::InvalidServer(entry.into()))
    })?;
    let addr = host.parse::<IpAddr>().map_err(|_| {
        Error::Resolution(ResolutionError::InvalidServer(entry.into()))
    })?;
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| {
            Error::Resolution(ResolutionError::InvalidServer(entry.into()))
        })?,
        None => DEF_PORT,
    };
    Ok(SocketAddr::new(addr, port))
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_restricts_the_opposite_protocol() {
        let udp = ServerConf::from_uri("udp://1.2.3.4").unwrap();
        assert_eq!(udp.protocols, Protocols::UDP);
        assert_eq!(udp.addr, "1.2.3.4:53".parse().unwrap());

        let tcp = ServerConf::from_uri("tcp://1.2.3.4:5353").unwrap();
        assert_eq!(tcp.protocols, Protocols::TCP);
        assert_eq!(tcp.addr, "1.2.3.4:5353".parse().unwrap());

        let any = ServerConf::from_uri("9.9.9.9").unwrap();
        assert_eq!(any.protocols, Protocols::ANY);
    }

    #[test]
    fn ipv6_hosts_use_brackets_for_ports() {
        let v6 = ServerConf::from_uri("[2001:db8::1]:5353").unwrap();
        assert_eq!(v6.addr, "[2001:db8::1]:5353".parse().unwrap());

        let bare = ServerConf::from_uri("2001:db8::1").unwrap();
        assert_eq!(bare.addr, "[2001:db8::1]:53".parse().unwrap());
    }

    #[test]
    fn invalid_servers_are_rejected() {
        for uri in [
            "",
            "dns://1.2.3.4",
            "example.com",
            "1.2.3.4:notaport",
            "[2001:db8::1",
            "[2001:db8::1]junk",
        ] {
            assert!(
                matches!(
                    ServerConf::from_uri(uri),
                    Err(Error::Resolution(
                        ResolutionError::InvalidServer(_)
                    ))
                ),
                "{:?} should be rejected",
                uri
            );
        }
    }

    #[test]
    fn nameserver_entries_default_the_port() {
        assert_eq!(
            parse_nameserver("8.8.8.8").unwrap(),
            "8.8.8.8:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_nameserver("2001:db8::53").unwrap(),
            "[2001:db8::53]:53".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_nameserver("not-an-ip").is_err());
    }
}
