//! Tag → fingerprint index for tag invalidation.
//!
//! The index may hold fingerprints whose entries were since evicted or
//! replaced; callers confirm against the entry's own tags before removing.

use std::collections::{HashMap, HashSet};

use querygrid_core::QueryFingerprint;

#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    tag_to_keys: HashMap<String, HashSet<QueryFingerprint>>,
}

impl TagIndex {
    pub(crate) fn add(&mut self, fingerprint: QueryFingerprint, tags: &[String]) {
        for tag in tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(fingerprint);
        }
    }

    /// Remove a tag and return every fingerprint it pointed at.
    pub(crate) fn take(&mut self, tag: &str) -> HashSet<QueryFingerprint> {
        self.tag_to_keys.remove(tag).unwrap_or_default()
    }

    /// Drop fingerprints for which `live` returns false.
    pub(crate) fn retain(&mut self, mut live: impl FnMut(&str, &QueryFingerprint) -> bool) {
        self.tag_to_keys.retain(|tag, keys| {
            keys.retain(|fp| live(tag, fp));
            !keys.is_empty()
        });
    }

    pub(crate) fn clear(&mut self) {
        self.tag_to_keys.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self, tag: &str) -> usize {
        self.tag_to_keys.get(tag).map_or(0, HashSet::len)
    }
}
