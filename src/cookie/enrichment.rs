//! Enrichments: the unit of knowledge about a tracked data object.
//!
//! An [`Enrichment`] records one piece of information gained about an
//! object: where it came from (`source`), when it was recorded
//! (`timestamp`), and a free-form JSON `metadata` map. Enrichments are
//! **immutable once recorded** and two enrichments are equal iff all
//! three fields are equal.
//!
//! [`EnrichmentCollection`] is the per-object log: insertion-ordered,
//! duplicates across sources permitted, append-only from the store's
//! point of view.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// One unit of knowledge added to a cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Name of the subsystem that produced this enrichment.
    pub source: String,

    /// Instant at which the enrichment was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    /// Free-form JSON-shaped metadata.
    pub metadata: Map<String, Value>,
}

impl Enrichment {
    pub fn new(
        source: impl Into<String>,
        timestamp: OffsetDateTime,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            source: source.into(),
            timestamp,
            metadata,
        }
    }

    /// Convenience constructor stamped with the current instant.
    pub fn now(source: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self::new(source, OffsetDateTime::now_utc(), metadata)
    }
}

/// Insertion-ordered collection of [`Enrichment`]s for one object.
///
/// Duplicates are permitted; ordering is append order and is preserved
/// through persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrichmentCollection(Vec<Enrichment>);

impl EnrichmentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, enrichment: Enrichment) {
        self.0.push(enrichment);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Enrichment> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&Enrichment> {
        self.0.last()
    }

    /// Iterates the enrichments recorded by `source`, in insertion order.
    pub fn from_source<'a, 'b: 'a>(
        &'a self,
        source: &'b str,
    ) -> impl Iterator<Item = &'a Enrichment> + 'a {
        self.0.iter().filter(move |e| e.source == source)
    }

    /// The enrichment from `source` with the latest timestamp.
    ///
    /// Ties are broken in favour of the later-inserted enrichment.
    pub fn most_recent_from_source<'a>(&'a self, source: &'a str) -> Option<&'a Enrichment> {
        self.from_source(source)
            .fold(None, |best: Option<&Enrichment>, e| match best {
                Some(b) if b.timestamp > e.timestamp => Some(b),
                _ => Some(e),
            })
    }

    /// Every distinct source that has contributed an enrichment.
    pub fn sources(&self) -> BTreeSet<&str> {
        self.0.iter().map(|e| e.source.as_str()).collect()
    }

    /// The enrichments in `self` that are not in `prior`, keyed by
    /// enrichment equality and respecting multiplicity.
    ///
    /// Used to answer "what is new since this snapshot". For an
    /// append-only log this is the suffix added after the snapshot was
    /// taken, but the comparison does not rely on that.
    pub fn diff<'a>(&'a self, prior: &EnrichmentCollection) -> Vec<&'a Enrichment> {
        let mut unmatched: Vec<&Enrichment> = prior.0.iter().collect();
        let mut fresh = Vec::new();

        for e in &self.0 {
            match unmatched.iter().position(|p| *p == e) {
                Some(i) => {
                    unmatched.swap_remove(i);
                }
                None => fresh.push(e),
            }
        }

        fresh
    }
}

impl FromIterator<Enrichment> for EnrichmentCollection {
    fn from_iter<I: IntoIterator<Item = Enrichment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a EnrichmentCollection {
    type Item = &'a Enrichment;
    type IntoIter = std::slice::Iter<'a, Enrichment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
