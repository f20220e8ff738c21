//! The table of in-flight requests.
//!
//! One table per resolver holds every request currently awaiting an
//! upstream response, keyed by the sixteen bit message ID. The transports'
//! demux paths complete entries; the dispatch path allocates them. IDs stay
//! unique across all servers until the request settles.

use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use crate::base::message::Message;
use crate::base::iana::Rtype;
use crate::error::Error;

/// The value at which the ID counter wraps.
const MAX_REQUEST_ID: u16 = u16::MAX;

/// What a completed request resolves to.
pub type RequestResult = Result<Message, Error>;

//------------ RequestEntry --------------------------------------------------

/// Bookkeeping for one in-flight request.
#[derive(Debug)]
struct RequestEntry {
    /// Completion sink for whoever awaits the response.
    sink: oneshot::Sender<RequestResult>,

    /// The queried name, for tracing.
    name: String,

    /// The queried type, for tracing.
    rtype: Rtype,

    /// The server the request went to.
    server: SocketAddr,
}

//------------ PendingRequests -----------------------------------------------

/// All in-flight requests of a resolver.
#[derive(Debug, Default)]
pub struct PendingRequests {
    /// Requests by message ID.
    requests: HashMap<u16, RequestEntry>,

    /// The ID handed out last.
    last_id: u16,
}

impl PendingRequests {
    /// Creates an empty table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates an unused ID and registers a request under it.
    ///
    /// The counter advances by one per allocation, wraps at
    /// `MAX_REQUEST_ID`, and skips IDs still in use. Returns `None` when
    /// every ID is taken.
    pub fn insert(
        &mut self,
        name: &str,
        rtype: Rtype,
        server: SocketAddr,
    ) -> Option<(u16, oneshot::Receiver<RequestResult>)> {
        if self.requests.len() > MAX_REQUEST_ID as usize {
            return None;
        }
        let mut id = self.last_id.wrapping_add(1);
        while self.requests.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.last_id = id;
        let (sink, receiver) = oneshot::channel();
        self.requests.insert(
            id,
            RequestEntry {
                sink,
                name: name.into(),
                rtype,
                server,
            },
        );
        Some((id, receiver))
    }

    /// Completes the request `id` if it was sent to `from`.
    ///
    /// Unknown IDs and IDs belonging to a different server are dropped
    /// silently; they may reflect a request that already timed out.
    pub fn complete(
        &mut self,
        id: u16,
        from: SocketAddr,
        result: RequestResult,
    ) -> bool {
        match self.requests.get(&id) {
            Some(entry) if entry.server == from => {}
            _ => return false,
        }
        let entry = self.requests.remove(&id).expect("entry checked above");
        tracing::trace!(
            "completing request {} for {} {}",
            id,
            entry.name,
            entry.rtype
        );
        let _ = entry.sink.send(result);
        true
    }

    /// Removes a request without completing it.
    ///
    /// Used by the timeout path; a response arriving later will find the ID
    /// unknown and be discarded.
    pub fn remove(&mut self, id: u16) -> bool {
        self.requests.remove(&id).is_some()
    }

    /// Fails every request pending on `server`.
    ///
    /// Returns the IDs that were failed.
    pub fn fail_server(
        &mut self,
        server: SocketAddr,
        error: Error,
    ) -> Vec<u16> {
        let ids: Vec<u16> = self
            .requests
            .iter()
            .filter(|(_, entry)| entry.server == server)
            .map(|(&id, _)| id)
            .collect();
        for &id in &ids {
            if let Some(entry) = self.requests.remove(&id) {
                let _ = entry.sink.send(Err(error.clone()));
            }
        }
        ids
    }

    /// Returns whether an ID is in use.
    #[cfg(test)]
    pub fn contains(&self, id: u16) -> bool {
        self.requests.contains_key(&id)
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionError;

    fn server() -> SocketAddr {
        "192.0.2.53:53".parse().unwrap()
    }

    #[test]
    fn ids_advance_and_skip_live_ones() {
        let mut table = PendingRequests::new();
        let (first, _rx1) =
            table.insert("a.example", Rtype::A, server()).unwrap();
        let (second, _rx2) =
            table.insert("b.example", Rtype::A, server()).unwrap();
        assert_eq!(second, first.wrapping_add(1));

        // Force the counter onto the live ID and watch it get skipped.
        table.last_id = first.wrapping_sub(1);
        let (third, _rx3) =
            table.insert("c.example", Rtype::A, server()).unwrap();
        assert_eq!(third, second.wrapping_add(1));
    }

    #[test]
    fn counter_wraps_at_the_top() {
        let mut table = PendingRequests::new();
        table.last_id = MAX_REQUEST_ID;
        let (id, _rx) =
            table.insert("a.example", Rtype::A, server()).unwrap();
        assert_eq!(id, 0);
    }

    #[tokio::test]
    async fn completion_checks_the_server() {
        let mut table = PendingRequests::new();
        let (id, mut rx) =
            table.insert("a.example", Rtype::A, server()).unwrap();

        let stranger: SocketAddr = "198.51.100.1:53".parse().unwrap();
        let err = Error::Resolution(ResolutionError::ConnectionLost);
        assert!(!table.complete(id, stranger, Err(err.clone())));
        assert!(table.contains(id));
        assert!(rx.try_recv().is_err());

        assert!(table.complete(id, server(), Err(err)));
        assert!(!table.contains(id));
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn fail_server_only_hits_its_requests() {
        let mut table = PendingRequests::new();
        let other: SocketAddr = "198.51.100.1:53".parse().unwrap();
        let (id_a, rx_a) =
            table.insert("a.example", Rtype::A, server()).unwrap();
        let (_id_b, mut rx_b) =
            table.insert("b.example", Rtype::A, other).unwrap();

        let failed = table.fail_server(
            server(),
            Error::Resolution(ResolutionError::ConnectionLost),
        );
        assert_eq!(failed, vec![id_a]);
        assert!(rx_a.await.unwrap().is_err());
        assert!(rx_b.try_recv().is_err());
    }
}
