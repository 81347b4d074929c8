//! BLAKE3 fingerprints of entity properties for dirty checking.
//!
//! A fingerprint is taken whenever an entity is read from or written to the
//! database. An entity whose current properties hash to the same value is
//! clean and produces no update statement.

use std::collections::HashMap;

use ogm_core::{EntityKind, NativeId, PropertyMap};

/// Compute the BLAKE3 hash of a property map.
///
/// Keys are visited in order and each value is rendered as canonical JSON,
/// so equal maps always produce equal hashes.
pub fn fingerprint(properties: &PropertyMap) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in properties {
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.to_string().as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

/// Last persisted fingerprint per entity.
#[derive(Debug, Default, Clone)]
pub struct EntityMemo {
    hashes: HashMap<(EntityKind, NativeId), blake3::Hash>,
}

impl EntityMemo {
    pub fn remember(&mut self, kind: EntityKind, id: NativeId, properties: &PropertyMap) {
        self.hashes.insert((kind, id), fingerprint(properties));
    }

    /// True when nothing was remembered for the entity or its properties
    /// changed since.
    pub fn is_dirty(&self, kind: EntityKind, id: NativeId, properties: &PropertyMap) -> bool {
        self.hashes
            .get(&(kind, id))
            .map_or(true, |known| *known != fingerprint(properties))
    }

    pub fn forget(&mut self, kind: EntityKind, id: NativeId) {
        self.hashes.remove(&(kind, id));
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
