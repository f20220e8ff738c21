//! An asynchronous DNS stub resolver.
//!
//! This crate implements the client side of DNS name resolution: given a
//! host name and a set of record types, it consults a static host table, a
//! TTL-bounded answer cache, and finally one or more recursive upstream
//! servers over UDP with TCP fallback, and hands back the answers.
//!
//! The interesting parts live below the surface. All questions to all
//! servers share two UDP sockets, one per address family, with inbound
//! datagrams demultiplexed by peer address; TCP connections are opened
//! lazily per server and multiplex their outstanding requests over the one
//! stream. Duplicate concurrent lookups are coalesced onto a single
//! upstream exchange, proven absence of records is cached negatively, and
//! CNAME and DNAME chains are chased to a bounded depth.
//!
//! # Example
//!
//! ```no_run
//! use stubresolv::{Resolver, ResolveOptions};
//!
//! # async fn example() -> Result<(), stubresolv::Error> {
//! let resolver = Resolver::new();
//! let answers = resolver
//!     .resolve("example.com", &ResolveOptions::default())
//!     .await?;
//! for answer in answers {
//!     println!("{}", answer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Collaborators that depend on the platform stay outside the crate:
//! discovering the system's name servers, parsing hosts files, and any
//! non-default cache backend plug in through the traits in [`conf`],
//! [`hosts`], and [`cache`].

pub use self::answer::Answer;
pub use self::error::Error;
pub use self::resolver::{
    Builder, QueryOptions, ResolveOptions, Resolver,
};

pub mod answer;
pub mod base;
pub mod cache;
pub mod conf;
pub mod error;
pub mod hosts;
pub mod resolver;

mod coalesce;
mod dgram;
mod lookup;
mod pending;
mod registry;
mod stream;
mod transport;
