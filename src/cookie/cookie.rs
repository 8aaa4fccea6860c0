//! The [`Cookie`] data structure.
//!
//! A **cookie** is the full accumulated knowledge about one tracked
//! data object: its identifier plus the ordered log of enrichments.
//! It carries no other mutable state; anything derived (for example the
//! set of sources seen) is computed from the enrichment log.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cookie::{Enrichment, EnrichmentCollection};

/// All accumulated knowledge about one data object.
///
/// The structure is suitable for persistence and inspection and can be
/// (de)serialized via `serde` to JSON or other formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    /// Opaque identifier, unique per tracked data object.
    pub id: String,

    /// Append-only enrichment log, in insertion order.
    pub enrichments: EnrichmentCollection,
}

impl Cookie {
    /// Creates a cookie with an empty enrichment log.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enrichments: EnrichmentCollection::new(),
        }
    }

    /// Every distinct source that has enriched this cookie.
    pub fn sources(&self) -> BTreeSet<&str> {
        self.enrichments.sources()
    }

    /// The most recent enrichment recorded by `source`, if any.
    pub fn most_recent_from_source<'a>(&'a self, source: &'a str) -> Option<&'a Enrichment> {
        self.enrichments.most_recent_from_source(source)
    }
}
