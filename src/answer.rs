//! Lookup answers.

use std::fmt;
use crate::base::iana::Rtype;

//------------ Answer --------------------------------------------------------

/// A single answer in caller-facing form.
///
/// An answer is the triple of record data in canonical string form, the
/// record type, and an optional time-to-live. Synthetic answers, such as
/// those produced for IP literals or from the static host table, have no
/// time-to-live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Answer {
    data: String,
    rtype: Rtype,
    ttl: Option<u32>,
}

impl Answer {
    /// Creates a new answer.
    pub fn new(
        data: impl Into<String>,
        rtype: Rtype,
        ttl: Option<u32>,
    ) -> Self {
        Answer {
            data: data.into(),
            rtype,
            ttl,
        }
    }

    /// Returns the record data.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Returns the record type.
    pub fn rtype(&self) -> Rtype {
        self.rtype
    }

    /// Returns the time-to-live, if the answer is bounded.
    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ttl {
            Some(ttl) => {
                write!(f, "{} {} {}", self.data, self.rtype, ttl)
            }
            None => write!(f, "{} {}", self.data, self.rtype),
        }
    }
}

//------------ TypeMap -------------------------------------------------------

/// Answers bucketed by record type.
///
/// Buckets keep the order in which types were first seen and each bucket
/// keeps the order of its answers, so flattening reproduces upstream
/// ordering.
#[derive(Clone, Debug, Default)]
pub struct TypeMap {
    buckets: Vec<(Rtype, Vec<Answer>)>,
}

impl TypeMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends an answer to its type's bucket.
    pub fn push(&mut self, answer: Answer) {
        let rtype = answer.rtype();
        match self.buckets.iter_mut().find(|(t, _)| *t == rtype) {
            Some((_, bucket)) => bucket.push(answer),
            None => self.buckets.push((rtype, vec![answer])),
        }
    }

    /// Inserts a whole bucket, creating the type entry if it is new.
    pub fn insert_bucket(&mut self, rtype: Rtype, answers: Vec<Answer>) {
        match self.buckets.iter_mut().find(|(t, _)| *t == rtype) {
            Some((_, bucket)) => bucket.extend(answers),
            None => self.buckets.push((rtype, answers)),
        }
    }

    /// Returns the bucket for a type.
    ///
    /// `None` means the type has not been seen; an empty slice means its
    /// absence has been proven.
    pub fn get(&self, rtype: Rtype) -> Option<&[Answer]> {
        self.buckets
            .iter()
            .find(|(t, _)| *t == rtype)
            .map(|(_, bucket)| bucket.as_slice())
    }

    /// Returns whether the type has a bucket, even an empty one.
    pub fn contains(&self, rtype: Rtype) -> bool {
        self.get(rtype).is_some()
    }

    /// Returns whether the type has at least one answer.
    pub fn has_answers(&self, rtype: Rtype) -> bool {
        self.get(rtype).is_some_and(|bucket| !bucket.is_empty())
    }

    /// Returns whether no bucket holds any answer.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|(_, bucket)| bucket.is_empty())
    }

    /// Iterates over the buckets in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (Rtype, &[Answer])> + '_ {
        self.buckets
            .iter()
            .map(|(rtype, bucket)| (*rtype, bucket.as_slice()))
    }

    /// Merges another map into this one.
    pub fn merge(&mut self, other: TypeMap) {
        for (rtype, bucket) in other.buckets {
            self.insert_bucket(rtype, bucket);
        }
    }

    /// Flattens into a sequence, requested types first in their order.
    ///
    /// Answers of types the caller did not ask for, typically CNAME records
    /// delivered alongside addresses, are appended after the requested ones.
    pub fn flatten(&self, requested: &[Rtype]) -> Vec<Answer> {
        let mut result = Vec::new();
        for &rtype in requested {
            if let Some(bucket) = self.get(rtype) {
                result.extend_from_slice(bucket);
            }
        }
        for (rtype, bucket) in &self.buckets {
            if !requested.contains(rtype) {
                result.extend_from_slice(bucket);
            }
        }
        result
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_keeps_requested_order() {
        let mut map = TypeMap::new();
        map.push(Answer::new("alias.example", Rtype::CNAME, Some(60)));
        map.push(Answer::new("::1", Rtype::AAAA, Some(30)));
        map.push(Answer::new("127.0.0.1", Rtype::A, Some(30)));
        map.push(Answer::new("127.0.0.2", Rtype::A, Some(30)));

        let flat = map.flatten(&[Rtype::A, Rtype::AAAA]);
        let data: Vec<_> = flat.iter().map(Answer::data).collect();
        assert_eq!(
            data,
            ["127.0.0.1", "127.0.0.2", "::1", "alias.example"]
        );
    }

    #[test]
    fn empty_bucket_proves_absence() {
        let mut map = TypeMap::new();
        map.insert_bucket(Rtype::AAAA, Vec::new());
        assert!(map.contains(Rtype::AAAA));
        assert!(!map.has_answers(Rtype::AAAA));
        assert!(map.is_empty());
    }
}
