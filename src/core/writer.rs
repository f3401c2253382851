//! Write-side state of an archive handle
//!
//! New sector content is gathered in an open block until the block is full
//! or a sector of a different shape arrives. Entries pointing into the open
//! block stay pending: they become part of the table only once the block
//! record has been appended and flushed. Until then reads are served from
//! the open block itself.

use crate::ddt::BlockLocator;
use crate::fixup::Fixup;
use crate::sector::SectorKind;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// SHA-256 of a sector's user data
pub type Fingerprint = [u8; 32];

pub fn fingerprint(user: &[u8]) -> Fingerprint {
    Sha256::digest(user).into()
}

/// A written sector whose block has not been stored yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub slot: u32,
    pub kind: SectorKind,
    pub fixups: Vec<Fixup>,
    /// Content matched a slot written earlier for another sector
    pub alias: bool,
}

/// Block being filled. Shared with readers behind a lock.
#[derive(Debug, Default)]
pub struct OpenBlock {
    pub user_len: usize,
    pub audio: bool,
    pub slots: u32,
    pub data: Vec<u8>,
    pub pending: HashMap<u64, PendingEntry>,
}

impl OpenBlock {
    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    /// True when a sector of this shape can join the block
    pub fn accepts(&self, user_len: usize, audio: bool) -> bool {
        self.is_empty() || (self.user_len == user_len && self.audio == audio)
    }

    pub fn slot(&self, slot: u32) -> Option<&[u8]> {
        if slot >= self.slots {
            return None;
        }
        let start = slot as usize * self.user_len;
        self.data.get(start..start + self.user_len)
    }

    /// Add user data, returning its slot
    pub fn push(&mut self, user: &[u8], audio: bool) -> u32 {
        if self.is_empty() {
            self.user_len = user.len();
            self.audio = audio;
        }
        self.data.extend_from_slice(user);
        self.slots += 1;
        self.slots - 1
    }

    /// Remove the most recently pushed slot
    pub fn pop(&mut self, slot: u32) {
        if self.slots > 0 && slot == self.slots - 1 {
            self.slots -= 1;
            self.data.truncate(slot as usize * self.user_len);
        }
    }

    pub fn reset(&mut self) {
        self.slots = 0;
        self.data.clear();
        self.pending.clear();
    }
}

/// Where identical content already lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplicate {
    Stored(BlockLocator),
    Open(u32),
}

/// State only the single writer touches
#[derive(Debug, Default)]
pub struct WriterState {
    /// Fingerprints of every stored slot; several candidates per
    /// fingerprint are kept in case of a collision
    pub fingerprints: HashMap<Fingerprint, Vec<BlockLocator>>,
    /// Fingerprints of the open block's slots
    pub open_fingerprints: HashMap<Fingerprint, Vec<u32>>,
    /// Shared zero block per user data length
    pub zero_blocks: HashMap<u32, u64>,
    /// False for a reopened archive until the first write rebuilds the map
    pub fingerprints_loaded: bool,
}

impl WriterState {
    pub fn new(fingerprints_loaded: bool) -> Self {
        WriterState {
            fingerprints_loaded,
            ..Default::default()
        }
    }

    pub fn remember(&mut self, fingerprint: Fingerprint, locator: BlockLocator) {
        self.fingerprints.entry(fingerprint).or_default().push(locator);
    }

    /// Move the open block's fingerprints to the stored map once it became
    /// block `block`
    pub fn promote_open(&mut self, block: u64) {
        for (fingerprint, slots) in self.open_fingerprints.drain() {
            let stored = self.fingerprints.entry(fingerprint).or_default();
            stored.extend(slots.into_iter().map(|slot| BlockLocator { block, slot }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_block_slots() {
        let mut open = OpenBlock::default();
        assert!(open.accepts(512, false));

        assert_eq!(open.push(&[1u8; 512], false), 0);
        assert_eq!(open.push(&[2u8; 512], false), 1);
        assert_eq!(open.slot(1).unwrap(), &[2u8; 512][..]);
        assert!(open.slot(2).is_none());

        assert!(open.accepts(512, false));
        assert!(!open.accepts(2048, false));
        assert!(!open.accepts(512, true));

        open.reset();
        assert!(open.is_empty());
        assert!(open.accepts(2048, true));
    }

    #[test]
    fn test_pop_only_takes_last_slot() {
        let mut open = OpenBlock::default();
        open.push(&[1u8; 16], false);
        open.push(&[2u8; 16], false);

        open.pop(0);
        assert_eq!(open.slots, 2);

        open.pop(1);
        assert_eq!(open.slots, 1);
        assert_eq!(open.data, vec![1u8; 16]);
        assert!(open.slot(1).is_none());
    }

    #[test]
    fn test_fingerprint_is_content_only() {
        assert_eq!(fingerprint(b"same"), fingerprint(b"same"));
        assert_ne!(fingerprint(b"same"), fingerprint(b"diff"));
    }

    #[test]
    fn test_promote_open() {
        let mut state = WriterState::new(true);
        let print = fingerprint(b"content");
        state.open_fingerprints.entry(print).or_default().push(3);
        state.promote_open(7);

        assert!(state.open_fingerprints.is_empty());
        assert_eq!(
            state.fingerprints[&print],
            vec![BlockLocator { block: 7, slot: 3 }]
        );
    }
}
