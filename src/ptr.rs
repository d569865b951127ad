use core::fmt;

use crate::blocklist::BlockId;

/// A handle to the payload of a live zone block.
///
/// This is what the zone hands out instead of a raw pointer. It names the
/// volume and the block header the payload belongs to, plus the generation of
/// that header at allocation time. Releasing the block bumps the generation,
/// so a stale `Ptr` is recognized by every zone operation and rejected.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ptr {
    pub(crate) volume: u32,
    pub(crate) block: BlockId,
    pub(crate) generation: u32,
}

impl Ptr {
    pub(crate) fn new(volume: usize, block: BlockId, generation: u32) -> Ptr {
        Ptr {
            volume: volume as u32,
            block,
            generation,
        }
    }

    /// Index of the volume holding the block.
    pub fn volume(&self) -> usize {
        self.volume as usize
    }
}

impl fmt::Debug for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ptr({}:{}#{})",
            self.volume,
            self.block.index(),
            self.generation
        )
    }
}
