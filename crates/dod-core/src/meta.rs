//! Acquired-data chunks and their metadata sidecar.
//!
//! Every read that leaves the acquisition core travels as a [`Chunk`]: the
//! atom payload as cheaply-cloneable [`Bytes`] plus a [`ChunkMeta`] map of
//! well-known keys. Consumers that only care about the payload ignore the
//! sidecar; consumers that stitch streams back together read the position
//! and trigger keys out of it.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Well-known metadata keys attached to an acquired chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaId {
    /// Sample-clock time of the chunk's first atom.
    Lmt,
    /// Absolute atom position of the chunk's first atom.
    AbsolutePosition,
    /// Number of atoms in the chunk.
    AtomCount,
    /// Nonzero when the hardware FIFO overran since the previous chunk.
    Overrun,
    /// Segmented mode: ticks between the addressed trigger and its
    /// atom-aligned base offset.
    TriggerResidue,
    /// Event code of the trigger that produced this chunk.
    EventKind,
    /// Device addressing epoch the chunk was resolved under.
    Epoch,
}

impl fmt::Display for MetaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lmt => "lmt",
            Self::AbsolutePosition => "absolute_position",
            Self::AtomCount => "atom_count",
            Self::Overrun => "overrun",
            Self::TriggerResidue => "trigger_residue",
            Self::EventKind => "event_kind",
            Self::Epoch => "epoch",
        };
        f.write_str(name)
    }
}

/// Ordered key-value sidecar for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMeta {
    entries: BTreeMap<MetaId, i64>,
}

impl ChunkMeta {
    /// An empty sidecar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, replacing any previous value.
    pub fn set(&mut self, id: MetaId, value: i64) -> &mut Self {
        self.entries.insert(id, value);
        self
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, id: MetaId) -> Option<i64> {
        self.entries.get(&id).copied()
    }

    /// Look up a key that counts things, clamping negatives to zero.
    #[must_use]
    pub fn get_count(&self, id: MetaId) -> Option<u64> {
        self.get(id).map(|v| u64::try_from(v).unwrap_or(0))
    }

    /// Number of keys present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate keys in `MetaId` order.
    pub fn iter(&self) -> impl Iterator<Item = (MetaId, i64)> + '_ {
        self.entries.iter().map(|(id, v)| (*id, *v))
    }
}

/// One delivered unit of acquired data.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Atom payload. Whole atoms only, never a partial atom.
    pub data: Bytes,
    /// Metadata sidecar.
    pub meta: ChunkMeta,
}

impl Chunk {
    /// Build a chunk from a payload and its sidecar.
    #[must_use]
    pub fn new(data: Bytes, meta: ChunkMeta) -> Self {
        Self { data, meta }
    }

    /// Number of atoms in the payload, from the sidecar when present,
    /// otherwise derived from the payload length.
    #[must_use]
    pub fn atom_count(&self, atom_size: usize) -> u64 {
        self.meta
            .get_count(MetaId::AtomCount)
            .unwrap_or_else(|| (self.data.len() / atom_size.max(1)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_set_get_overwrite() {
        let mut meta = ChunkMeta::new();
        meta.set(MetaId::Lmt, 4_000).set(MetaId::AtomCount, 16);
        assert_eq!(meta.get(MetaId::Lmt), Some(4_000));
        meta.set(MetaId::Lmt, 4_100);
        assert_eq!(meta.get(MetaId::Lmt), Some(4_100));
        assert_eq!(meta.get(MetaId::Overrun), None);
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn test_meta_iterates_in_key_order() {
        let mut meta = ChunkMeta::new();
        meta.set(MetaId::Epoch, 1)
            .set(MetaId::Lmt, 2)
            .set(MetaId::AtomCount, 3);
        let keys: Vec<MetaId> = meta.iter().map(|(id, _)| id).collect();
        assert_eq!(
            keys,
            vec![MetaId::Lmt, MetaId::AtomCount, MetaId::Epoch]
        );
    }

    #[test]
    fn test_chunk_atom_count_prefers_sidecar() {
        let mut meta = ChunkMeta::new();
        meta.set(MetaId::AtomCount, 3);
        let chunk = Chunk::new(Bytes::from(vec![0u8; 64]), meta);
        assert_eq!(chunk.atom_count(8), 3);

        let bare = Chunk::new(Bytes::from(vec![0u8; 64]), ChunkMeta::new());
        assert_eq!(bare.atom_count(8), 8);
    }
}
