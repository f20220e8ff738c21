//! De-duplicating concurrent identical lookups.
//!
//! While a lookup for a given name and type set is in flight, callers
//! asking the same question attach to the existing future instead of
//! issuing their own upstream exchange. The entry disappears when the
//! shared future settles; later callers start fresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use crate::answer::Answer;
use crate::base::iana::Rtype;
use crate::error::Error;

/// The settled value of a coalesced lookup.
pub type LookupResult = Result<Vec<Answer>, Error>;

/// The shared handle late joiners attach to.
pub type SharedLookup = Shared<BoxFuture<'static, LookupResult>>;

//------------ Coalescer -----------------------------------------------------

/// The in-flight lookups of a resolver.
#[derive(Default)]
pub struct Coalescer {
    inflight: Mutex<HashMap<String, SharedLookup>>,
}

impl Coalescer {
    /// Creates an empty coalescer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Builds the key for a lowercased name and its requested type set.
    pub fn key(name: &str, types: &[Rtype]) -> String {
        let mut ints: Vec<u16> =
            types.iter().map(|rtype| rtype.to_int()).collect();
        ints.sort_unstable();
        let joined = ints
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join("/");
        format!("{}#{}", name, joined)
    }

    /// Returns the in-flight lookup for `key`, creating it when absent.
    ///
    /// `make` produces the actual work future; it only runs when no lookup
    /// for the key is currently in flight. The returned handle removes the
    /// map entry as part of settling.
    pub fn drive<F>(
        self: Arc<Self>,
        key: String,
        make: F,
    ) -> SharedLookup
    where
        F: FnOnce() -> BoxFuture<'static, LookupResult>,
    {
        let mut inflight = self.inflight.lock().expect("poisoned");
        if let Some(found) = inflight.get(&key) {
            return found.clone();
        }
        let this = self.clone();
        let entry_key = key.clone();
        let work = make();
        let shared = async move {
            let result = work.await;
            this.inflight
                .lock()
                .expect("poisoned")
                .remove(&entry_key);
            result
        }
        .boxed()
        .shared();
        inflight.insert(key, shared.clone());
        shared
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn keys_sort_the_type_set() {
        assert_eq!(
            Coalescer::key("host.example", &[Rtype::AAAA, Rtype::A]),
            "host.example#1/28"
        );
        assert_eq!(
            Coalescer::key("host.example", &[Rtype::A, Rtype::AAAA]),
            Coalescer::key("host.example", &[Rtype::AAAA, Rtype::A]),
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let coalescer = Arc::new(Coalescer::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let key = Coalescer::key("host.example", &[Rtype::A]);

        let make = |runs: Arc<AtomicUsize>| {
            move || {
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok(vec![Answer::new("192.0.2.1", Rtype::A, None)])
                }
                .boxed()
            }
        };

        let first =
            coalescer.clone().drive(key.clone(), make(runs.clone()));
        let second =
            coalescer.clone().drive(key.clone(), make(runs.clone()));
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Settled lookups are gone; the next caller starts fresh.
        let third = coalescer.clone().drive(key, make(runs.clone()));
        assert!(third.await.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
