//! Memory volumes: one span of platform memory tiled by a block list.

use core::ops::Range;

use crate::blocklist::{BlockId, BlockList, HEADER_SIZE};

/// A single contiguous span of memory obtained from a heap grower.
pub struct Volume {
    memory: Box<[u8]>,
    pub blocks: BlockList,
}

impl Volume {
    pub fn new(memory: Box<[u8]>) -> Volume {
        let blocks = BlockList::new(memory.len());
        Volume { memory, blocks }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Give the backing memory back, e.g. to return it to its grower.
    pub fn into_memory(self) -> Box<[u8]> {
        self.memory
    }

    /// Byte range of the payload of block `id` within the volume.
    pub fn payload_range(&self, id: BlockId) -> Range<usize> {
        let block = self.blocks.get(id);
        (block.offset + HEADER_SIZE)..(block.offset + block.size)
    }

    pub fn payload(&self, id: BlockId) -> &[u8] {
        let range = self.payload_range(id);
        &self.memory[range]
    }

    pub fn payload_mut(&mut self, id: BlockId) -> &mut [u8] {
        let range = self.payload_range(id);
        &mut self.memory[range]
    }

    /// Copy `len` payload bytes between two blocks of this volume.
    pub fn copy_payload(&mut self, from: BlockId, to: BlockId, len: usize) {
        let src = self.payload_range(from).start;
        let dst = self.payload_range(to).start;
        self.memory.copy_within(src..src + len, dst);
    }

    /// Find a free block of at least `size` bytes, starting at the rover.
    ///
    /// Outside fast mode this scans the whole ring once, stepping over blocks
    /// that must stay (sequences in one step, whatever their members' tags)
    /// and evicting purgeable blocks on
    /// the way, so their space merges into the candidate block. In fast mode
    /// only the block at the rover is considered.
    ///
    /// The returned block is free and still unsplit.
    pub fn find_fit(&mut self, size: usize, fast: bool) -> Option<BlockId> {
        let list = &mut self.blocks;
        let fits = |list: &BlockList, id: BlockId| list.is_free(id) && list.get(id).size >= size;

        // If there is a free block behind the rover, back up over it.
        let mut base = list.rover();
        if list.is_free(list.prev(base)) {
            base = list.prev(base);
        }

        if fast {
            return if fits(&*list, base) { Some(base) } else { None };
        }

        // Once the scan passes the sentinel it is on its second lap, and it
        // ends when it reaches the point where it started.
        let stop = list.get(base).offset;
        let mut wrapped = false;
        let mut rover = base;

        loop {
            if fits(&*list, base) {
                return Some(base);
            }

            if rover == BlockId::SENTINEL {
                if wrapped {
                    return None;
                }
                wrapped = true;
                rover = list.next(rover);
                base = rover;
                continue;
            }

            if wrapped && list.get(rover).offset >= stop {
                return None;
            }

            let block = list.get(rover);
            match (block.tag, block.seq_first) {
                (None, _) => rover = list.next(rover),
                (Some(_), Some(head)) => {
                    // A sequence is never evicted piecemeal; skip all of it.
                    rover = list.get(head).seq_last.unwrap_or(rover);
                    rover = list.next(rover);
                    base = rover;
                }
                (Some(tag), None) if !tag.is_purgeable() => {
                    rover = list.next(rover);
                    base = rover;
                }
                (Some(tag), None) => {
                    log::trace!("Evicting {:?} block {:?} for {} bytes", tag, rover, size);
                    // The block before base is in use, so it survives the
                    // merge and tells us where base ends up.
                    let anchor = list.prev(base);
                    list.release(rover);
                    base = list.next(anchor);
                    rover = list.next(base);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::owner::{Owner, OwnerSlot};
    use crate::tag::Tag;

    use test_env_log::test;

    const MIN_FRAGMENT: usize = HEADER_SIZE + 32;

    fn volume(capacity: usize) -> Volume {
        Volume::new(vec![0; capacity].into_boxed_slice())
    }

    fn take(vol: &mut Volume, size: usize, tag: Tag, slot: Option<&OwnerSlot>) -> BlockId {
        let id = vol.find_fit(size, false).expect("should fit");
        vol.blocks.split(id, size, MIN_FRAGMENT);
        vol.blocks.claim(id, tag, Owner::from_slot(slot));
        id
    }

    #[test]
    fn test_payload() {
        let mut vol = volume(512);
        let a = take(&mut vol, 128, Tag::Map, None);
        let b = take(&mut vol, 128, Tag::Map, None);
        assert_eq!(vol.payload_range(a), HEADER_SIZE..128);
        assert_eq!(vol.payload(b).len(), 128 - HEADER_SIZE);

        vol.payload_mut(a).iter_mut().for_each(|x| *x = 0xAB);
        vol.copy_payload(a, b, 16);
        assert!(vol.payload(b)[..16].iter().all(|&x| x == 0xAB));
        assert!(vol.payload(b)[16..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_skips_unpurgeable() {
        let mut vol = volume(1024);
        let a = take(&mut vol, 256, Tag::AppStatic, None);
        let b = take(&mut vol, 256, Tag::Map, None);
        let rest = take(&mut vol, 512, Tag::GameStatic, None);
        assert_eq!(vol.capacity(), 1024);

        vol.blocks.release(b);
        assert_eq!(vol.find_fit(257, false), None);
        assert_eq!(vol.find_fit(256, false), Some(b));
        assert!(!vol.blocks.is_free(a));
        assert!(!vol.blocks.is_free(rest));
    }

    #[test]
    fn test_evicts_purgeable() {
        let mut vol = volume(1024);
        let slot = OwnerSlot::new();
        take(&mut vol, 256, Tag::AppStatic, None);
        let cache = take(&mut vol, 256, Tag::Cache, Some(&slot));
        take(&mut vol, 512, Tag::AppStatic, None);

        let found = vol.find_fit(200, false);
        assert_eq!(found, Some(cache));
        assert!(vol.blocks.is_free(cache));
        vol.blocks.validate(0).unwrap();
    }

    #[test]
    fn test_evicts_block_just_behind_rover() {
        let mut vol = volume(1024);
        let slot = OwnerSlot::new();
        take(&mut vol, 512, Tag::AppStatic, None);
        let cache = take(&mut vol, 256, Tag::Cache, Some(&slot));
        // The rover now sits on the free tail, right behind the cache block.
        assert!(vol.blocks.is_free(vol.blocks.rover()));

        assert_eq!(vol.find_fit(512, false), Some(cache));
        assert_eq!(vol.blocks.get(cache).size, 512);
        vol.blocks.validate(0).unwrap();
    }

    #[test]
    fn test_sequence_skipped_whole() {
        let mut vol = volume(2048);
        for _ in 0..4 {
            take(&mut vol, 128, Tag::MapStatic, None);
        }
        let tail = vol.blocks.rover();
        assert_eq!(vol.find_fit(4096, false), None);
        assert_eq!(vol.find_fit(512, false), Some(tail));
    }

    #[test]
    fn test_purgeable_sequence_member_kept() {
        let mut vol = volume(1024);
        let slot = OwnerSlot::new();
        let head = take(&mut vol, 256, Tag::MapStatic, None);
        let member = take(&mut vol, 256, Tag::MapStatic, None);
        take(&mut vol, 512, Tag::AppStatic, None);

        vol.blocks.get_mut(member).tag = Some(Tag::Cache);
        vol.blocks.get_mut(member).owner = Owner::from_slot(Some(&slot));
        vol.blocks.validate(0).unwrap();

        assert_eq!(vol.find_fit(128, false), None);
        assert!(!vol.blocks.is_free(head));
        assert!(!vol.blocks.is_free(member));
    }

    #[test]
    fn test_fast_mode_only_looks_at_rover() {
        let mut vol = volume(1024);
        let slot = OwnerSlot::new();
        take(&mut vol, 512, Tag::Cache, Some(&slot));
        take(&mut vol, 512, Tag::AppStatic, None);

        // The rover is at the sentinel; fast mode gives up immediately.
        assert_eq!(vol.find_fit(64, true), None);
        assert!(!vol.blocks.is_free(vol.blocks.next(BlockId::SENTINEL)));

        assert!(vol.find_fit(64, false).is_some());
    }
}
