//! Zone allocator types.
//!
//! ## Basic Types
//!
//! ### [`RawZone`](struct.RawZone.html)
//!
//! A `RawZone` is the single-threaded zone: a list of memory volumes, each
//! tiled by a [`BlockList`](../blocklist/struct.BlockList.html), plus the fast
//! mode flag. All allocation, eviction and release logic lives here. It takes
//! `&mut self`, so internal steps such as evicting a purgeable block during an
//! allocation never need to take a lock again.
//!
//! ### [`Zone`](struct.Zone.html)
//!
//! A `Zone` wraps `RawZone` with a spin lock to make it thread-safe. Every
//! public operation holds the lock for its whole duration.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over obtaining
//! memory for new volumes from the platform.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a heap grower with a fixed budget. It is mainly useful for
//! testing.

use core::cmp;
use core::fmt;
use std::collections::TryReserveError;

use spin::{Mutex, MutexGuard};

use crate::batch::{Batch, Element};
use crate::blocklist::{aligned, BlockId, Stats, HEADER_SIZE};
use crate::config::ZoneConfig;
use crate::fault::{fatal, Fault};
use crate::owner::{Owner, OwnerSlot};
use crate::ptr::Ptr;
use crate::tag::Tag;
use crate::volume::Volume;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Obtain a zero-filled span of at least `size` bytes for a new volume.
    fn grow_heap(&mut self, size: usize) -> Result<Box<[u8]>, Self::Err>;

    /// Take back a volume's memory at shutdown.
    fn release_heap(&mut self, memory: Box<[u8]>) {
        drop(memory);
    }
}

/// SystemHeap gets volume memory from the global allocator, in whole pages.
#[derive(Default, Debug)]
pub struct SystemHeap {
    // Just for tracking, not really needed
    pub pages: usize,
    pub growths: usize,
}

impl HeapGrower for SystemHeap {
    type Err = TryReserveError;

    fn grow_heap(&mut self, size: usize) -> Result<Box<[u8]>, Self::Err> {
        // Page size is 4 kb "on most architectures"
        let pagesize = 4096;
        let to_allocate = round_up(size, pagesize);

        let mut memory = Vec::new();
        memory.try_reserve_exact(to_allocate)?;
        memory.resize(to_allocate, 0u8);

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok(memory.into_boxed_slice())
    }
}

/// A heap grower that hands out at most `limit` bytes in total.
#[derive(Debug)]
pub struct ToyHeap {
    pub page_size: usize,
    pub size: usize,
    pub limit: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            page_size: 64,
            size: 0,
            limit: 256 * 1024,
        }
    }
}

impl ToyHeap {
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn grow_heap(&mut self, size: usize) -> Result<Box<[u8]>, Self::Err> {
        let allocating = round_up(size, self.page_size);
        if self.size + allocating > self.limit {
            return Err(ToyHeapOverflowError());
        }

        self.size += allocating;
        Ok(vec![0; allocating].into_boxed_slice())
    }

    fn release_heap(&mut self, memory: Box<[u8]>) {
        self.size -= memory.len();
    }
}

/// The single-threaded zone: volumes of blocks, tags, owners and eviction.
///
/// Volumes are never resized or removed while the zone is alive; the zone
/// grows by adding volumes, and the newest volume is searched first.
pub struct RawZone<G> {
    pub grower: G,
    config: ZoneConfig,
    volumes: Vec<Volume>,
    fast_malloc: bool,
}

impl<G: HeapGrower> RawZone<G> {
    /// Create a new `RawZone` with its first volume.
    pub fn new(grower: G, config: ZoneConfig) -> Self {
        let mut zone = RawZone {
            grower,
            config,
            volumes: Vec::new(),
            fast_malloc: false,
        };
        zone.create_volume(zone.config.volume_size);
        zone
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Number of bytes of volume space a request for `size` bytes occupies,
    /// or `None` if no volume could be that large.
    pub fn block_size(size: usize) -> Option<usize> {
        aligned(size)?.checked_add(HEADER_SIZE)
    }

    /// The smallest volume worth creating: one block and a fragment.
    pub fn min_volume_size(&self) -> usize {
        HEADER_SIZE + self.config.min_fragment
    }

    fn create_volume(&mut self, size: usize) -> usize {
        let size = cmp::max(size, self.min_volume_size());
        let memory = match self.grower.grow_heap(size) {
            Ok(memory) => memory,
            Err(err) => fatal(Fault::VolumeUnavailable {
                size,
                reason: format!("{:?}", err),
            }),
        };
        if memory.len() < size {
            fatal(Fault::VolumeUnavailable {
                size,
                reason: format!("heap grower returned only {} bytes", memory.len()),
            });
        }

        log::debug!(
            "New {:.1} MB memory volume",
            memory.len() as f64 / 1024.0 / 1024.0
        );
        self.volumes.push(Volume::new(memory));
        self.volumes.len() - 1
    }

    /// Whether `ptr` still refers to a live block.
    pub fn is_live(&self, ptr: Ptr) -> bool {
        self.volumes
            .get(ptr.volume())
            .and_then(|vol| vol.blocks.live(ptr.block, ptr.generation))
            .is_some()
    }

    /// Find the volume and block for a handle, or fail.
    fn locate(&self, ptr: Ptr, op: &'static str) -> (usize, BlockId) {
        if !self.is_live(ptr) {
            fatal(Fault::NotLive { op, ptr });
        }
        (ptr.volume(), ptr.block)
    }

    ////////////////////////////////////////////////////////////
    // Allocation and release

    /// Allocate `size` bytes with purge tag `tag`.
    ///
    /// Purgeable tags need an `owner`; the new handle is written into it, and
    /// the zone clears it again if the block is ever evicted. Returns `None`
    /// only when `size` is zero.
    pub fn allocate(&mut self, size: usize, tag: Tag, owner: Option<&OwnerSlot>) -> Option<Ptr> {
        if size == 0 {
            // You can't allocate "nothing."
            return None;
        }
        if tag.is_purgeable() && owner.is_none() {
            fatal(Fault::OwnerRequired { op: "allocate" });
        }

        let needed = match Self::block_size(size) {
            Some(needed) => needed,
            None => fatal(Fault::VolumeUnavailable {
                size,
                reason: "request size overflows".to_owned(),
            }),
        };
        let fast = self.fast_malloc;

        let volumes = &mut self.volumes;
        let found = (0..volumes.len())
            .rev()
            .find_map(|index| volumes[index].find_fit(needed, fast).map(|id| (index, id)));

        let (index, base) = match found {
            Some(found) => found,
            None => {
                // We've run out of volumes. Make a new one with enough memory.
                let size = match needed.checked_add(self.config.growth_slack) {
                    Some(wanted) => cmp::max(self.config.volume_size, wanted),
                    None => fatal(Fault::VolumeUnavailable {
                        size: needed,
                        reason: "request size overflows".to_owned(),
                    }),
                };
                let index = self.create_volume(size);
                match self.volumes[index].find_fit(needed, fast) {
                    Some(id) => (index, id),
                    None => fatal(Fault::VolumeTooSmall {
                        volume: index,
                        size: needed,
                    }),
                }
            }
        };

        let blocks = &mut self.volumes[index].blocks;
        blocks.split(base, needed, self.config.min_fragment);
        blocks.claim(base, tag, Owner::from_slot(owner));

        let ptr = Ptr::new(index, base, blocks.get(base).generation);
        if let Some(slot) = owner {
            slot.set(Some(ptr));
        }
        Some(ptr)
    }

    /// Allocate as with [`allocate`](#method.allocate), with the whole payload
    /// set to zero.
    pub fn allocate_zeroed(
        &mut self,
        size: usize,
        tag: Tag,
        owner: Option<&OwnerSlot>,
    ) -> Option<Ptr> {
        let ptr = self.allocate(size, tag, owner)?;
        self.bytes_mut(ptr).iter_mut().for_each(|b| *b = 0);
        Some(ptr)
    }

    /// Release a block. Releasing `None` is ignored.
    pub fn release<P: Into<Option<Ptr>>>(&mut self, ptr: P) {
        let ptr = match ptr.into() {
            Some(ptr) => ptr,
            None => {
                log::warn!("Attempt to release a null zone pointer ignored");
                return;
            }
        };

        let (index, id) = self.locate(ptr, "release");
        self.volumes[index].blocks.release(id);
    }

    /// Move an allocation into a new block of `new_size` bytes.
    ///
    /// The contents are copied as far as they fit and the old block is
    /// released. An existing block keeps its tag; `tag` is used only when
    /// `ptr` is `None`. Blocks with owners lose them: the new block is always
    /// unowned, so purgeable blocks cannot be reallocated.
    pub fn reallocate(&mut self, ptr: Option<Ptr>, new_size: usize, tag: Tag) -> Option<Ptr> {
        self.resize(ptr, new_size, tag, false)
    }

    /// As [`reallocate`](#method.reallocate), but any bytes past the copied
    /// contents are zeroed.
    pub fn reallocate_zeroed(
        &mut self,
        ptr: Option<Ptr>,
        new_size: usize,
        tag: Tag,
    ) -> Option<Ptr> {
        self.resize(ptr, new_size, tag, true)
    }

    fn resize(&mut self, ptr: Option<Ptr>, new_size: usize, tag: Tag, zero: bool) -> Option<Ptr> {
        let tag = match ptr {
            Some(ptr) => self.get_tag(ptr),
            None => tag,
        };

        let fresh = match self.allocate(new_size, tag, None) {
            Some(fresh) => fresh,
            None => {
                if let Some(old) = ptr {
                    self.release(old);
                }
                return None;
            }
        };

        let copied = match ptr {
            Some(old) => {
                let len = cmp::min(self.payload_len(old), new_size);
                self.copy_payload(old, fresh, len);
                self.release(old);
                len
            }
            None => 0,
        };

        if zero {
            self.bytes_mut(fresh)[copied..]
                .iter_mut()
                .for_each(|b| *b = 0);
        }
        Some(fresh)
    }

    fn copy_payload(&mut self, from: Ptr, to: Ptr, len: usize) {
        let (src, src_id) = self.locate(from, "copy");
        let (dst, dst_id) = self.locate(to, "copy");

        if src == dst {
            self.volumes[src].copy_payload(src_id, dst_id, len);
            return;
        }

        let (source, target) = if src < dst {
            let (low, high) = self.volumes.split_at_mut(dst);
            (&low[src], &mut high[0])
        } else {
            let (low, high) = self.volumes.split_at_mut(src);
            (&high[0], &mut low[dst])
        };
        target.payload_mut(dst_id)[..len].copy_from_slice(&source.payload(src_id)[..len]);
    }

    /// Release every block whose tag is within `low..=high`, in all volumes.
    pub fn release_tag_range(&mut self, low: Tag, high: Tag) {
        let released: usize = self
            .volumes
            .iter_mut()
            .map(|vol| vol.blocks.release_tag_range(low, high))
            .sum();
        log::debug!("Released {} blocks tagged {} to {}", released, low, high);
    }

    ////////////////////////////////////////////////////////////
    // Tags and owners

    pub fn change_tag(&mut self, ptr: Ptr, tag: Tag) {
        let (index, id) = self.locate(ptr, "change_tag");
        let block = self.volumes[index].blocks.get_mut(id);
        if tag.is_purgeable() && !block.owner.has_slot() {
            fatal(Fault::OwnerRequired { op: "change_tag" });
        }
        block.tag = Some(tag);
    }

    /// Replace the owner of a block. The slot is not written to.
    pub fn change_owner(&mut self, ptr: Ptr, owner: Option<&OwnerSlot>) {
        let (index, id) = self.locate(ptr, "change_owner");
        let block = self.volumes[index].blocks.get_mut(id);
        if owner.is_none() && block.tag.map_or(false, Tag::is_purgeable) {
            fatal(Fault::OwnerRequired { op: "change_owner" });
        }
        block.owner = Owner::from_slot(owner);
    }

    /// The owner slot of a block, if it has one and it still exists.
    pub fn get_owner(&self, ptr: Ptr) -> Option<OwnerSlot> {
        let (index, id) = self.locate(ptr, "get_owner");
        self.volumes[index].blocks.get(id).owner.slot()
    }

    pub fn get_tag(&self, ptr: Ptr) -> Tag {
        let (index, id) = self.locate(ptr, "get_tag");
        match self.volumes[index].blocks.get(id).tag {
            Some(tag) => tag,
            None => fatal(Fault::NotLive { op: "get_tag", ptr }),
        }
    }

    /// Whether the block is part of a sequence.
    pub fn is_sequenced(&self, ptr: Ptr) -> bool {
        let (index, id) = self.locate(ptr, "is_sequenced");
        self.volumes[index].blocks.get(id).seq_first.is_some()
    }

    ////////////////////////////////////////////////////////////
    // Payload access

    pub fn payload_len(&self, ptr: Ptr) -> usize {
        let (index, id) = self.locate(ptr, "payload_len");
        self.volumes[index].blocks.get(id).payload_len()
    }

    pub fn bytes(&self, ptr: Ptr) -> &[u8] {
        let (index, id) = self.locate(ptr, "bytes");
        self.volumes[index].payload(id)
    }

    pub fn bytes_mut(&mut self, ptr: Ptr) -> &mut [u8] {
        let (index, id) = self.locate(ptr, "bytes_mut");
        self.volumes[index].payload_mut(id)
    }

    ////////////////////////////////////////////////////////////
    // Modes and diagnostics

    /// In fast mode, volumes are not scanned for free or purgeable blocks: if
    /// the block at a volume's rover does not fit, the next volume is tried,
    /// and a new one created when none is left.
    pub fn set_fast_mode(&mut self, enabled: bool) {
        self.fast_malloc = enabled;
    }

    pub fn fast_mode(&self) -> bool {
        self.fast_malloc
    }

    /// Check all volumes and gather their statistics, stopping at the first
    /// inconsistency.
    pub fn validate(&self) -> Result<Stats, Fault> {
        let mut stats = Stats::default();
        for (index, vol) in self.volumes.iter().enumerate() {
            stats.merge(vol.blocks.validate(index)?);
        }
        Ok(stats)
    }

    pub fn stats(&self) -> Stats {
        match self.validate() {
            Ok(stats) => stats,
            Err(fault) => fatal(fault),
        }
    }

    /// Check all volumes for consistency. Any inconsistency is fatal.
    pub fn check_heap(&self) {
        log::trace!("Checking {} zone volumes", self.volumes.len());
        if let Err(fault) = self.validate() {
            fatal(fault);
        }
    }

    /// The amount of unused memory in all volumes combined.
    pub fn free_bytes_total(&self) -> usize {
        if cfg!(debug_assertions) {
            self.check_heap();
        }
        self.volumes
            .iter()
            .flat_map(|vol| vol.blocks.iter())
            .filter(|(_, block)| block.is_free())
            .map(|(_, block)| block.size)
            .sum()
    }

    /// Destroy all the volumes, giving their memory back to the grower.
    pub fn shutdown(self) -> G {
        let RawZone {
            mut grower,
            volumes,
            ..
        } = self;

        let count = volumes.len();
        let mut total = 0;
        for vol in volumes {
            total += vol.capacity();
            grower.release_heap(vol.into_memory());
        }
        log::info!("Zone shutdown: used {} volumes, total {} bytes", count, total);

        grower
    }
}

impl<G> fmt::Display for RawZone<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, vol) in self.volumes.iter().enumerate() {
            writeln!(f, "volume {}: {}", index, vol.blocks)?;
        }
        Ok(())
    }
}

/// A thread-safe zone, using a spin lock around a RawZone.
pub struct Zone<G> {
    raw: Mutex<RawZone<G>>,
}

impl Zone<SystemHeap> {
    /// Create a zone whose first volume holds `initial_volume_size` bytes.
    /// Later volumes use the same size.
    pub fn init(initial_volume_size: usize) -> Self {
        let config = ZoneConfig::default().with_volume_size(initial_volume_size);
        Zone::new(SystemHeap::default(), config)
    }
}

impl<G: HeapGrower> Zone<G> {
    pub fn new(grower: G, config: ZoneConfig) -> Self {
        Zone {
            raw: Mutex::new(RawZone::new(grower, config)),
        }
    }

    /// Get a locked reference to the underlying RawZone.
    ///
    /// Every other zone operation blocks while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, RawZone<G>> {
        self.raw.lock()
    }

    pub fn allocate(&self, size: usize, tag: Tag, owner: Option<&OwnerSlot>) -> Option<Ptr> {
        self.lock().allocate(size, tag, owner)
    }

    pub fn allocate_zeroed(&self, size: usize, tag: Tag, owner: Option<&OwnerSlot>) -> Option<Ptr> {
        self.lock().allocate_zeroed(size, tag, owner)
    }

    pub fn release<P: Into<Option<Ptr>>>(&self, ptr: P) {
        self.lock().release(ptr)
    }

    pub fn reallocate(&self, ptr: Option<Ptr>, new_size: usize, tag: Tag) -> Option<Ptr> {
        self.lock().reallocate(ptr, new_size, tag)
    }

    pub fn reallocate_zeroed(&self, ptr: Option<Ptr>, new_size: usize, tag: Tag) -> Option<Ptr> {
        self.lock().reallocate_zeroed(ptr, new_size, tag)
    }

    pub fn change_tag(&self, ptr: Ptr, tag: Tag) {
        self.lock().change_tag(ptr, tag)
    }

    pub fn change_owner(&self, ptr: Ptr, owner: Option<&OwnerSlot>) {
        self.lock().change_owner(ptr, owner)
    }

    pub fn get_owner(&self, ptr: Ptr) -> Option<OwnerSlot> {
        self.lock().get_owner(ptr)
    }

    pub fn get_tag(&self, ptr: Ptr) -> Tag {
        self.lock().get_tag(ptr)
    }

    pub fn is_live(&self, ptr: Ptr) -> bool {
        self.lock().is_live(ptr)
    }

    pub fn is_sequenced(&self, ptr: Ptr) -> bool {
        self.lock().is_sequenced(ptr)
    }

    pub fn release_tag_range(&self, low: Tag, high: Tag) {
        self.lock().release_tag_range(low, high)
    }

    pub fn set_fast_mode(&self, enabled: bool) {
        self.lock().set_fast_mode(enabled)
    }

    pub fn fast_mode(&self) -> bool {
        self.lock().fast_mode()
    }

    pub fn free_bytes_total(&self) -> usize {
        self.lock().free_bytes_total()
    }

    pub fn check_heap(&self) {
        self.lock().check_heap()
    }

    pub fn validate(&self) -> Result<Stats, Fault> {
        self.lock().validate()
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    pub fn payload_len(&self, ptr: Ptr) -> usize {
        self.lock().payload_len(ptr)
    }

    /// Run `f` on the payload of a block, with the zone locked.
    pub fn with_bytes<R, F: FnOnce(&mut [u8]) -> R>(&self, ptr: Ptr, f: F) -> R {
        f(self.lock().bytes_mut(ptr))
    }

    pub fn batch_create(&self, element_size: usize, batch_count: usize, tag: Tag) -> Batch {
        self.lock().batch_create(element_size, batch_count, tag)
    }

    pub fn batch_allocate(&self, batch: &mut Batch) -> Element {
        self.lock().batch_allocate(batch)
    }

    pub fn batch_destroy(&self, batch: Batch) {
        self.lock().batch_destroy(batch)
    }

    /// Run `f` on the bytes of a batch element, with the zone locked.
    pub fn with_element<R, F: FnOnce(&mut [u8]) -> R>(&self, element: &Element, f: F) -> R {
        f(self.lock().element_bytes_mut(element))
    }

    /// Destroy all the volumes and hand back the grower.
    pub fn shutdown(self) -> G {
        self.raw.into_inner().shutdown()
    }
}
