use core::fmt;

use static_assertions::const_assert;

use crate::fault::Fault;
use crate::owner::Owner;
use crate::tag::Tag;

/// All block sizes are rounded to pointer alignment.
pub const ALIGN: usize = core::mem::size_of::<usize>();

/// Every block reserves this many bytes ahead of its payload, so that block
/// sizes account for their bookkeeping the same way in every volume.
pub const HEADER_SIZE: usize = 32;
const_assert!(HEADER_SIZE % ALIGN == 0);
const_assert!(ALIGN.is_power_of_two());

/// Round `size` up to pointer alignment, or `None` if that overflows.
pub const fn aligned(size: usize) -> Option<usize> {
    match size.checked_add(ALIGN - 1) {
        Some(padded) => Some(padded & !(ALIGN - 1)),
        None => None,
    }
}

/// Index of a block header inside its volume's block table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// The permanent node that closes every ring. It never holds a payload.
    pub const SENTINEL: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A block header.
///
/// Headers live in a table on the side rather than in front of the payload,
/// but `offset` and `size` still describe the full span of the block inside
/// the volume, header bytes included.
#[derive(Debug)]
pub struct Block {
    pub offset: usize,
    pub size: usize,
    /// `None` means the block is free.
    pub tag: Option<Tag>,
    pub(crate) owner: Owner,
    pub seq_first: Option<BlockId>,
    pub seq_last: Option<BlockId>,
    /// Bumped every time the block stops being live.
    pub generation: u32,
    prev: BlockId,
    next: BlockId,
}

impl Block {
    fn free_span(offset: usize, size: usize, prev: BlockId, next: BlockId) -> Block {
        Block {
            offset,
            size,
            tag: None,
            owner: Owner::Free,
            seq_first: None,
            seq_last: None,
            generation: 0,
            prev,
            next,
        }
    }

    pub fn is_free(&self) -> bool {
        self.tag.is_none()
    }

    /// The bytes usable by the block's owner.
    pub fn payload_len(&self) -> usize {
        self.size - HEADER_SIZE
    }
}

/// A `BlockList` tiles one volume with blocks.
///
/// The blocks form a circular doubly-linked list through a sentinel node. The
/// sentinel counts as an in-use, non-purgeable block sitting at the very end
/// of the volume, so it stops merges and is never handed out.
///
/// It maintains a few internal invariants:
///
/// - Each block starts exactly where the previous one ends, and the last one
///   ends where the volume ends.
/// - `next.prev` of every block is the block itself.
/// - No two blocks are both free (those are merged on release).
/// - Sequence members are contiguous and share one head.
pub struct BlockList {
    blocks: Vec<Block>,
    // Table slots not currently linked into the ring.
    vacant: Vec<BlockId>,
    rover: BlockId,
}

pub struct BlockIter<'list> {
    list: &'list BlockList,
    next: BlockId,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = (BlockId, &'list Block);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == BlockId::SENTINEL {
            return None;
        }
        let id = self.next;
        let block = self.list.get(id);
        self.next = block.next;
        Some((id, block))
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = (BlockId, &'list Block);
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for (id, block) in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            match block.tag {
                None => write!(f, "Free({}@{}, {})", id.0, block.offset, block.size)?,
                Some(tag) => write!(f, "{}({}@{}, {})", tag, id.0, block.offset, block.size)?,
            }
        }

        write!(f, ")")
    }
}

/// Size and occupancy of one or more volumes.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub volumes: usize,
    pub capacity: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub largest_free: usize,
}

impl Stats {
    pub fn merge(&mut self, other: Stats) {
        self.volumes += other.volumes;
        self.capacity += other.capacity;
        self.blocks += other.blocks;
        self.free_blocks += other.free_blocks;
        self.free_bytes += other.free_bytes;
        self.used_bytes += other.used_bytes;
        self.largest_free = self.largest_free.max(other.largest_free);
    }
}

impl BlockList {
    /// Create a list covering `capacity` bytes with a single free block.
    pub fn new(capacity: usize) -> BlockList {
        let first = BlockId(1);
        let mut sentinel = Block::free_span(capacity, 0, first, first);
        sentinel.tag = Some(Tag::AppStatic);
        sentinel.owner = Owner::Unowned;

        BlockList {
            blocks: vec![
                sentinel,
                Block::free_span(0, capacity, BlockId::SENTINEL, BlockId::SENTINEL),
            ],
            vacant: Vec::new(),
            rover: first,
        }
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            list: self,
            next: self.next(BlockId::SENTINEL),
        }
    }

    pub fn get(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Look up a live block by handle parts.
    pub fn live(&self, id: BlockId, generation: u32) -> Option<&Block> {
        if id == BlockId::SENTINEL {
            return None;
        }
        self.blocks
            .get(id.index())
            .filter(|b| !b.is_free() && b.generation == generation)
    }

    pub fn next(&self, id: BlockId) -> BlockId {
        self.get(id).next
    }

    pub fn prev(&self, id: BlockId) -> BlockId {
        self.get(id).prev
    }

    pub fn is_free(&self, id: BlockId) -> bool {
        self.get(id).is_free()
    }

    pub fn rover(&self) -> BlockId {
        self.rover
    }

    /// Number of blocks in the ring, sentinel excluded.
    pub fn len(&self) -> usize {
        self.blocks.len() - self.vacant.len() - 1
    }

    fn new_block(&mut self, block: Block) -> BlockId {
        match self.vacant.pop() {
            Some(id) => {
                let generation = self.get(id).generation;
                *self.get_mut(id) = Block { generation, ..block };
                id
            }
            None => {
                self.blocks.push(block);
                BlockId((self.blocks.len() - 1) as u32)
            }
        }
    }

    /// Remove `next(id)` from the ring and add its span to `id`.
    fn absorb_next(&mut self, id: BlockId) {
        let gone = self.next(id);
        debug_assert!(gone != BlockId::SENTINEL);

        let (size, after) = {
            let block = self.get(gone);
            (block.size, block.next)
        };
        self.get_mut(id).size += size;
        self.get_mut(id).next = after;
        self.get_mut(after).prev = id;

        if self.rover == gone {
            self.rover = id;
        }

        let slot = self.get_mut(gone);
        slot.tag = None;
        slot.owner = Owner::Free;
        slot.seq_first = None;
        slot.seq_last = None;
        self.vacant.push(gone);
    }

    /// Cut a used block of exactly `size` bytes off the front of free block
    /// `id`, leaving the rest as a new free block, if the rest would be larger
    /// than `min_fragment`. Otherwise the whole block is kept.
    pub fn split(&mut self, id: BlockId, size: usize, min_fragment: usize) {
        let block = self.get(id);
        debug_assert!(block.is_free() && block.size >= size);

        let extra = block.size - size;
        if extra <= min_fragment {
            return;
        }

        let offset = block.offset + size;
        let next = block.next;
        let fragment = self.new_block(Block::free_span(offset, extra, id, next));
        log::trace!(
            "Splitting {} bytes off block {:?} leaves {:?} with {}",
            size,
            id,
            fragment,
            extra
        );

        self.get_mut(next).prev = fragment;
        let block = self.get_mut(id);
        block.next = fragment;
        block.size = size;
    }

    /// Mark free block `id` as in use, and point the rover past it.
    pub(crate) fn claim(&mut self, id: BlockId, tag: Tag, owner: Owner) {
        let previous_head = self.get(self.prev(id)).seq_first;

        let block = self.get_mut(id);
        debug_assert!(block.is_free());
        block.tag = Some(tag);
        block.owner = owner;

        if tag.is_sequenced() {
            // Chain onto the run in front of us, or start a new one.
            let head = previous_head.unwrap_or(id);
            block.seq_first = Some(head);
            block.seq_last = Some(id);
            self.get_mut(head).seq_last = Some(id);
        } else {
            block.seq_first = None;
            block.seq_last = None;
        }

        self.rover = self.next(id);
    }

    // Mark one block free and tell its owner, without merging anything.
    fn free_one(&mut self, id: BlockId) {
        let block = self.get_mut(id);
        debug_assert!(!block.is_free() && id != BlockId::SENTINEL);

        let owner = core::mem::take(&mut block.owner);
        block.tag = None;
        block.generation = block.generation.wrapping_add(1);
        block.seq_first = None;
        block.seq_last = None;
        owner.clear();
    }

    /// Free a live block, tell its owner and merge it with free neighbors.
    ///
    /// A sequence lives and dies as a whole: releasing any member frees every
    /// member of its run.
    ///
    /// Returns the free block that now contains the released span.
    pub fn release(&mut self, id: BlockId) -> BlockId {
        self.release_run(id).0
    }

    // Returns the merged free block and the number of blocks freed.
    fn release_run(&mut self, id: BlockId) -> (BlockId, usize) {
        let head = self.get(id).seq_first;
        let first = head.unwrap_or(id);

        self.free_one(first);
        let mut count = 1;
        if let Some(head) = head {
            let mut member = self.next(first);
            while self.get(member).seq_first == Some(head) {
                self.free_one(member);
                count += 1;
                member = self.next(member);
            }
        }

        let mut id = first;
        for _ in 1..count {
            self.absorb_next(id);
        }

        let prev = self.prev(id);
        if self.is_free(prev) {
            self.absorb_next(prev);
            id = prev;
        }

        if self.is_free(self.next(id)) {
            self.absorb_next(id);
        }

        (id, count)
    }

    /// Release every live block with a tag in `low..=high`. Returns how many
    /// blocks were released.
    pub fn release_tag_range(&mut self, low: Tag, high: Tag) -> usize {
        let mut released = 0;
        let mut id = self.next(BlockId::SENTINEL);
        while id != BlockId::SENTINEL {
            id = match self.get(id).tag {
                Some(tag) if low <= tag && tag <= high => {
                    let (merged, count) = self.release_run(id);
                    released += count;
                    self.next(merged)
                }
                _ => self.next(id),
            };
        }
        released
    }

    /// Walk the ring and verify every invariant, returning the first
    /// violation found.
    pub fn validate(&self, volume: usize) -> Result<Stats, Fault> {
        let mut stats = Stats {
            volumes: 1,
            capacity: self.get(BlockId::SENTINEL).offset,
            ..Default::default()
        };

        let first = self.next(BlockId::SENTINEL);
        if self.get(first).offset != 0 {
            return Err(Fault::BadStart { volume });
        }

        let mut id = BlockId::SENTINEL;
        // Every linked block can be visited at most once.
        for _ in 0..self.blocks.len() {
            let block = self.get(id);
            let next = block.next;
            let following = self.blocks.get(next.index()).ok_or(Fault::BrokenRing { volume })?;

            if following.prev != id {
                return Err(Fault::BadBackLink { volume, block: id });
            }

            if id != BlockId::SENTINEL {
                self.check_block(volume, id, block, following)?;

                stats.blocks += 1;
                if block.is_free() {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                    stats.largest_free = stats.largest_free.max(block.size);
                } else {
                    stats.used_bytes += block.size;
                }
            }

            id = next;
            if id == BlockId::SENTINEL {
                return Ok(stats);
            }
        }

        Err(Fault::BrokenRing { volume })
    }

    fn check_block(
        &self,
        volume: usize,
        id: BlockId,
        block: &Block,
        following: &Block,
    ) -> Result<(), Fault> {
        if block.size == 0 {
            return Err(Fault::ZeroSizeBlock { volume, block: id });
        }
        if block.offset + block.size != following.offset {
            return Err(Fault::BlockGap { volume, block: id });
        }
        if block.is_free() && following.is_free() {
            return Err(Fault::ConsecutiveFree { volume, block: id });
        }
        if block.is_free() != block.owner.is_free() {
            return Err(Fault::OwnerMismatch { volume, block: id });
        }
        if let Some(tag) = block.tag {
            if tag.is_purgeable() && !block.owner.has_slot() {
                return Err(Fault::OwnerlessPurgeable { volume, block: id });
            }
        }

        if let Some(head) = block.seq_first {
            let first = self.get(head);
            if first.seq_first != Some(head) {
                return Err(Fault::BadSequenceHead { volume, block: id });
            }
            if first.seq_last != Some(id) && following.seq_first != Some(head) {
                return Err(Fault::DisconnectedSequence { volume, block: id });
            }
        }

        Ok(())
    }
}
