//! The lookup pipeline.
//!
//! A lookup runs through three stations: the static host table, the answer
//! cache, and finally the configured upstream servers, walked in order with
//! every remaining question issued to one server as a batch. Alias chains
//! in upstream responses are chased, answers are written back to the cache
//! with per-type TTLs, and proven absence is negative-cached.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, trace};
use crate::answer::{Answer, TypeMap};
use crate::base::iana::{Rcode, Rtype};
use crate::base::message::Message;
use crate::cache::{cache_key, NEGATIVE_TTL};
use crate::coalesce::Coalescer;
use crate::conf::ServerConf;
use crate::error::{Error, ResolutionError};
use crate::resolver::{Core, QueryOptions, ResolveOptions};

/// The longest alias chain that gets chased.
const MAX_CHAIN: usize = 30;

//------------ WalkOptions ---------------------------------------------------

/// The per-lookup knobs threaded through the pipeline.
#[derive(Clone, Debug)]
pub(crate) struct WalkOptions {
    /// Caller-supplied server override.
    server: Option<String>,

    /// Caller-supplied timeout override.
    timeout: Option<Duration>,

    /// Whether the host table is consulted.
    hosts: bool,

    /// Whether the cache is consulted and populated.
    cache: bool,

    /// Whether alias chains are chased.
    follow_chains: bool,
}

impl WalkOptions {
    fn from_resolve(options: &ResolveOptions) -> Self {
        WalkOptions {
            server: options.server.clone(),
            timeout: options.timeout,
            hosts: options.hosts,
            cache: options.cache,
            follow_chains: true,
        }
    }

    fn from_query(options: &QueryOptions) -> Self {
        WalkOptions {
            server: options.server.clone(),
            timeout: options.timeout,
            hosts: options.hosts,
            cache: options.cache,
            follow_chains: options.recurse,
        }
    }
}

//------------ Pipeline ------------------------------------------------------

impl Core {
    /// Resolves a host name into address answers.
    pub(crate) async fn resolve(
        &self,
        name: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<Answer>, Error> {
        // IP literals answer themselves without any machinery.
        if let Ok(addr) = name.parse::<IpAddr>() {
            let rtype = match addr {
                IpAddr::V4(_) => Rtype::A,
                IpAddr::V6(_) => Rtype::AAAA,
            };
            return Ok(vec![Answer::new(name, rtype, None)]);
        }
        validate_name(name)?;
        let types = if options.types.is_empty() {
            vec![Rtype::A, Rtype::AAAA]
        } else {
            options.types.clone()
        };
        if types.iter().any(|rtype| !rtype.is_address()) {
            return Err(Error::InvalidType);
        }
        let lower = name.to_ascii_lowercase();

        let key = Coalescer::key(&lower, &types);
        let shared = self.coalescer.clone().drive(key, || {
            let core = self.arc();
            let name = name.to_string();
            let options = options.clone();
            async move { core.run_resolve(name, lower, types, options).await }
                .boxed()
        });
        shared.await
    }

    /// The uncoalesced tail of a resolve.
    async fn run_resolve(
        self: Arc<Self>,
        name: String,
        lower: String,
        types: Vec<Rtype>,
        options: ResolveOptions,
    ) -> Result<Vec<Answer>, Error> {
        let walk_options = WalkOptions::from_resolve(&options);
        let mut result = TypeMap::new();
        let mut missing = Vec::new();

        let hosts = if options.hosts {
            Some(self.hosts_table(options.reload_hosts).await)
        } else {
            None
        };
        for &rtype in &types {
            if let Some(hosts) = &hosts {
                if let Some(addr) = hosts.lookup(&lower, rtype) {
                    trace!("{} {} found in host table", lower, rtype);
                    result.push(Answer::new(addr, rtype, None));
                    continue;
                }
            }
            if options.cache {
                if let Some(answers) =
                    self.cache.get(&cache_key(&lower, rtype)).await
                {
                    trace!("{} {} served from cache", lower, rtype);
                    result.insert_bucket(rtype, answers);
                    continue;
                }
            }
            missing.push(rtype);
        }

        if missing.is_empty() {
            if result.is_empty() {
                return Err(Error::no_records(&name, true));
            }
            return Ok(result.flatten(&types));
        }

        let have_partial = !result.is_empty();
        match self.walk(&lower, &missing, &walk_options, 0).await {
            Ok(map) => result.merge(map),
            Err(err) if have_partial => {
                // The cached part of the answer beats the failure.
                debug!(
                    "upstream failed for {} ({}), using partial result",
                    lower, err
                );
            }
            Err(err) => return Err(err),
        }

        if result.is_empty() {
            return Err(Error::no_records(&name, false));
        }
        Ok(result.flatten(&types))
    }

    /// Queries a single record type, the low-level entry point.
    pub(crate) async fn query(
        &self,
        name: &str,
        rtype: Rtype,
        options: &QueryOptions,
    ) -> Result<Vec<Answer>, Error> {
        validate_name(name)?;
        let lower = name.to_ascii_lowercase();
        let walk_options = WalkOptions::from_query(options);

        if options.hosts && rtype.is_address() {
            let hosts = self.hosts_table(options.reload_hosts).await;
            if let Some(addr) = hosts.lookup(&lower, rtype) {
                return Ok(vec![Answer::new(addr, rtype, None)]);
            }
        }
        if options.cache {
            if let Some(answers) =
                self.cache.get(&cache_key(&lower, rtype)).await
            {
                if answers.is_empty() {
                    return Err(Error::no_records(name, true));
                }
                return Ok(answers);
            }
        }

        let map = self.walk(&lower, &[rtype], &walk_options, 0).await?;
        if map.is_empty() {
            return Err(Error::no_records(name, false));
        }
        Ok(map.flatten(&[rtype]))
    }

    /// Walks the server list, issuing the questions to one server at a
    /// time as a batch.
    ///
    /// Per-server failures are swallowed and the walk moves on; only when
    /// every server of every attempt has failed does an error surface: a
    /// timeout if nothing but timeouts happened, the catch-all otherwise.
    async fn walk(
        &self,
        name: &str,
        types: &[Rtype],
        options: &WalkOptions,
        depth: usize,
    ) -> Result<TypeMap, Error> {
        let plan = self.server_plan(options).await?;
        if plan.servers.is_empty() {
            return Err(Error::Resolution(
                ResolutionError::AllServersFailed,
            ));
        }
        let mut timeouts_only = true;

        for _ in 0..plan.attempts.max(1) {
            for server in &plan.servers {
                let entry = self
                    .registry
                    .get_or_load(server.addr, server.protocols);
                let questions = types.iter().map(|&rtype| {
                    self.question(
                        name,
                        rtype,
                        entry.clone(),
                        plan.timeout,
                        options,
                        depth,
                    )
                });
                let mut batch = TypeMap::new();
                let mut failure = None;
                for outcome in join_all(questions).await {
                    match outcome {
                        Ok(map) => batch.merge(map),
                        Err(err) => {
                            failure.get_or_insert(err);
                        }
                    }
                }
                match failure {
                    None => return Ok(batch),
                    Some(err) => {
                        if !err.is_timeout() {
                            timeouts_only = false;
                        }
                        debug!(
                            "server {} failed for {}: {}",
                            server.addr, name, err
                        );
                    }
                }
            }
        }

        if timeouts_only {
            Err(Error::timeout(plan.timeout.as_millis() as u64))
        } else {
            Err(Error::Resolution(ResolutionError::AllServersFailed))
        }
    }

    /// Issues one question to one server and post-processes the response.
    async fn question(
        &self,
        name: &str,
        rtype: Rtype,
        entry: Arc<crate::registry::ServerEntry>,
        budget: Duration,
        options: &WalkOptions,
        depth: usize,
    ) -> Result<TypeMap, Error> {
        let transports = self.transports().await?;
        let response =
            transports.exchange(&entry, name, rtype, budget).await?;
        self.process_response(name, rtype, response, options, depth)
            .await
    }

    /// Applies the response policy of a single exchange.
    ///
    /// NXDOMAIN counts as a proper "no records" reply and is negative
    /// cached; every other non-zero response code fails the request and
    /// stays out of the cache, as do transport failures.
    async fn process_response(
        &self,
        name: &str,
        rtype: Rtype,
        response: Message,
        options: &WalkOptions,
        depth: usize,
    ) -> Result<TypeMap, Error> {
        let rcode = response.header().rcode();
        if rcode != Rcode::NOERROR && rcode != Rcode::NXDOMAIN {
            return Err(Error::Resolution(
                ResolutionError::ServerFailure(rcode),
            ));
        }

        let mut map = TypeMap::new();
        for record in response.answers() {
            map.push(Answer::new(
                record.data(),
                record.rtype(),
                Some(record.ttl()),
            ));
        }

        if map.is_empty() {
            if options.cache {
                self.cache
                    .set(
                        &cache_key(name, rtype),
                        Vec::new(),
                        NEGATIVE_TTL,
                    )
                    .await;
            }
            let mut absence = TypeMap::new();
            absence.insert_bucket(rtype, Vec::new());
            return Ok(absence);
        }

        if options.cache {
            for (rtype, bucket) in map.iter() {
                if bucket.is_empty() {
                    continue;
                }
                self.cache
                    .set(
                        &cache_key(name, rtype),
                        bucket.to_vec(),
                        min_positive_ttl(bucket),
                    )
                    .await;
            }
        }

        // Chase the alias chain unless the caller asked for aliases.
        if options.follow_chains
            && !rtype.is_alias()
            && !map.has_answers(rtype)
        {
            if let Some(next) = chain_target(name, &response) {
                if depth >= MAX_CHAIN {
                    return Err(Error::Resolution(
                        ResolutionError::ChainTooLong,
                    ));
                }
                trace!("{} {} chains to {}", name, rtype, next);
                let tail = self
                    .chase(next, rtype, options.clone(), depth + 1)
                    .await?;
                map.merge(tail);
            }
        }
        Ok(map)
    }

    /// Looks up a chain target, re-entering the pipeline from the cache.
    fn chase(
        &self,
        name: String,
        rtype: Rtype,
        options: WalkOptions,
        depth: usize,
    ) -> BoxFuture<'static, Result<TypeMap, Error>> {
        let core = self.arc();
        async move {
            if options.hosts && rtype.is_address() {
                let hosts = core.hosts_table(false).await;
                if let Some(addr) = hosts.lookup(&name, rtype) {
                    let mut map = TypeMap::new();
                    map.push(Answer::new(addr, rtype, None));
                    return Ok(map);
                }
            }
            if options.cache {
                if let Some(answers) =
                    core.cache.get(&cache_key(&name, rtype)).await
                {
                    let mut map = TypeMap::new();
                    map.insert_bucket(rtype, answers);
                    return Ok(map);
                }
            }
            core.walk(&name, &[rtype], &options, depth).await
        }
        .boxed()
    }

    /// Resolves which servers to walk and with which budget.
    ///
    /// A caller-supplied server replaces the configured list; the timeout
    /// falls back to the configured one.
    async fn server_plan(
        &self,
        options: &WalkOptions,
    ) -> Result<ServerPlan, Error> {
        if let Some(uri) = &options.server {
            let server = ServerConf::from_uri(uri)?;
            let timeout = match options.timeout {
                Some(timeout) => timeout,
                None => self.system_conf().await?.timeout,
            };
            return Ok(ServerPlan {
                servers: vec![server],
                timeout,
                attempts: 1,
            });
        }
        let conf = self.system_conf().await?;
        Ok(ServerPlan {
            servers: conf.servers.clone(),
            timeout: options.timeout.unwrap_or(conf.timeout),
            attempts: conf.attempts,
        })
    }
}

//------------ ServerPlan ----------------------------------------------------

/// The resolved upstream plan for one lookup.
pub(crate) struct ServerPlan {
    pub servers: Vec<ServerConf>,
    pub timeout: Duration,
    pub attempts: usize,
}

//------------ Free functions ------------------------------------------------

/// Checks a host name against the validation rules.
///
/// Labels are 1 to 63 characters of letters, digits, underscore, and
/// hyphen, may not begin or end with a hyphen, and the whole name must not
/// exceed 253 characters.
pub(crate) fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 253 {
        return Err(Error::InvalidName);
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::InvalidName);
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::InvalidName);
        }
        if !label
            .bytes()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'-')
        {
            return Err(Error::InvalidName);
        }
    }
    Ok(())
}

/// Follows the alias records inside one response as far as they go.
///
/// Starting from the queried name, CNAME records with a matching owner
/// rewrite the whole name and DNAME records rewrite the owner suffix. The
/// final name is returned if any rewrite happened. A response carrying a
/// lone DNAME whose owner does not match is taken at its word and the
/// record target is used directly.
fn chain_target(name: &str, response: &Message) -> Option<String> {
    let start = name.to_ascii_lowercase();
    let mut current = start.clone();
    // One rewrite per alias record is the most a response can support.
    let mut budget = response.answers().len();
    while budget > 0 {
        budget -= 1;
        let mut advanced = false;
        for record in response.answers() {
            let owner = record.owner().to_ascii_lowercase();
            match record.rtype() {
                Rtype::CNAME if owner == current => {
                    current = record.data().to_ascii_lowercase();
                    advanced = true;
                    break;
                }
                Rtype::DNAME => {
                    let suffix = format!(".{}", owner);
                    if let Some(prefix) = current.strip_suffix(&suffix) {
                        current = format!(
                            "{}.{}",
                            prefix,
                            record.data().to_ascii_lowercase()
                        );
                        advanced = true;
                        break;
                    }
                }
                _ => {}
            }
        }
        if !advanced {
            break;
        }
    }
    if current == start {
        let mut dnames = response
            .answers()
            .iter()
            .filter(|record| record.rtype() == Rtype::DNAME);
        if let (Some(dname), None) = (dnames.next(), dnames.next()) {
            return Some(dname.data().to_ascii_lowercase());
        }
        return None;
    }
    Some(current)
}

/// The smallest positive TTL of a bucket, for its cache lifetime.
fn min_positive_ttl(answers: &[Answer]) -> u32 {
    answers
        .iter()
        .filter_map(Answer::ttl)
        .filter(|&ttl| ttl > 0)
        .min()
        .unwrap_or(0)
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn name_validation() {
        for good in [
            "example.com",
            "a.b.c.d",
            "has-underscores_ok.example",
            "x",
            "123.example",
        ] {
            assert!(validate_name(good).is_ok(), "{:?}", good);
        }
        let long_label = "a".repeat(64);
        let long_name = vec!["a"; 128].join(".");
        for bad in [
            "",
            "bad..name",
            ".leading.dot",
            "trailing.dot.",
            "-leading.example",
            "trailing-.example",
            "spaces in.example",
            "uni\u{00e7}ode.example",
            long_label.as_str(),
            long_name.as_str(),
        ] {
            assert!(
                matches!(validate_name(bad), Err(Error::InvalidName)),
                "{:?}",
                bad
            );
        }
    }

    fn response_with(
        records: &[(&str, Rtype, &str)],
    ) -> Message {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&[0x80, 0x00]);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(records.len() as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        for (owner, rtype, data) in records {
            for label in owner.split('.') {
                buf.push(label.len() as u8);
                buf.extend_from_slice(label.as_bytes());
            }
            buf.push(0);
            buf.extend_from_slice(&rtype.to_int().to_be_bytes());
            buf.extend_from_slice(&[0, 1]);
            buf.extend_from_slice(&60u32.to_be_bytes());
            let mut rdata = Vec::new();
            for label in data.split('.') {
                rdata.push(label.len() as u8);
                rdata.extend_from_slice(label.as_bytes());
            }
            rdata.push(0);
            buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata);
        }
        Message::from_octets(Bytes::from(buf)).unwrap()
    }

    #[test]
    fn chain_follows_cnames_in_order() {
        let response = response_with(&[
            ("a.example", Rtype::CNAME, "b.example"),
            ("b.example", Rtype::CNAME, "c.example"),
        ]);
        assert_eq!(
            chain_target("A.Example", &response).unwrap(),
            "c.example"
        );
    }

    #[test]
    fn chain_substitutes_dname_suffixes() {
        let response =
            response_with(&[("old.example", Rtype::DNAME, "new.example")]);
        assert_eq!(
            chain_target("www.old.example", &response).unwrap(),
            "www.new.example"
        );
        // A lone unmatched DNAME is taken at its word.
        assert_eq!(
            chain_target("elsewhere.test", &response).unwrap(),
            "new.example"
        );
    }

    #[test]
    fn looped_chains_are_not_chased() {
        let response = response_with(&[
            ("a.example", Rtype::CNAME, "b.example"),
            ("b.example", Rtype::CNAME, "a.example"),
        ]);
        // The rewrite budget runs out back at the start.
        assert!(chain_target("a.example", &response).is_none());
    }

    #[test]
    fn min_ttl_skips_zero() {
        let answers = vec![
            Answer::new("192.0.2.1", Rtype::A, Some(0)),
            Answer::new("192.0.2.2", Rtype::A, Some(300)),
            Answer::new("192.0.2.3", Rtype::A, Some(60)),
        ];
        assert_eq!(min_positive_ttl(&answers), 60);
    }
}
