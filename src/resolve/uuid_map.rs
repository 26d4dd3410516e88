use std::collections::HashMap;
use uuid::Uuid;

/// Candidate UUID to canonical UUID, frozen once built.
///
/// Canonical entities live in an arena; every candidate points at an arena index, so a
/// merge never has to rewrite earlier mappings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UuidMap {
    index: HashMap<Uuid, usize>,
    canonical: Vec<Uuid>,
}

impl UuidMap {
    /// Canonical UUID for `candidate`, if it was seen during resolution.
    pub fn resolve(&self, candidate: Uuid) -> Option<Uuid> {
        self.index.get(&candidate).map(|&i| self.canonical[i])
    }

    pub fn canonical_index(&self, candidate: Uuid) -> Option<usize> {
        self.index.get(&candidate).copied()
    }

    pub fn is_canonical(&self, uuid: Uuid) -> bool {
        self.resolve(uuid) == Some(uuid)
    }

    pub fn canonical_uuids(&self) -> &[Uuid] {
        &self.canonical
    }

    /// Number of mapped candidate UUIDs (canonical ones included).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct UuidMapBuilder {
    map: UuidMap,
}

impl UuidMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canonical UUID (mapped to itself). Returns its arena index.
    pub fn add_canonical(&mut self, uuid: Uuid) -> usize {
        if let Some(&i) = self.map.index.get(&uuid) {
            return i;
        }
        let i = self.map.canonical.len();
        self.map.canonical.push(uuid);
        self.map.index.insert(uuid, i);
        i
    }

    /// Point `candidate` at the canonical entity in slot `canonical`.
    pub fn map(&mut self, candidate: Uuid, canonical: usize) {
        debug_assert!(canonical < self.map.canonical.len());
        self.map.index.insert(candidate, canonical);
    }

    pub fn lookup(&self, candidate: Uuid) -> Option<usize> {
        self.map.canonical_index(candidate)
    }

    pub fn build(self) -> UuidMap {
        self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_maps_to_canonical() {
        let a = Uuid::new_v4();
        let dup = Uuid::new_v4();
        let mut b = UuidMapBuilder::new();
        let i = b.add_canonical(a);
        assert_eq!(b.add_canonical(a), i);
        b.map(dup, i);
        let map = b.build();

        assert_eq!(map.resolve(dup), Some(a));
        assert_eq!(map.resolve(a), Some(a));
        assert!(map.is_canonical(a));
        assert!(!map.is_canonical(dup));
        assert_eq!(map.resolve(Uuid::new_v4()), None);
        assert_eq!(map.len(), 2);
        assert_eq!(map.canonical_uuids(), &[a]);
    }
}
