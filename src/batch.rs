//! Batches: fixed-size elements carved out of larger zone chunks.
//!
//! A batch asks the zone for one chunk of `batch_count` elements at a time,
//! and hands out elements from the newest chunk by offset. Elements are never
//! released one by one; the whole batch goes at once.

use crate::allocators::{HeapGrower, RawZone};
use crate::fault::{fatal, Fault};
use crate::ptr::Ptr;
use crate::tag::Tag;

#[derive(Debug)]
struct Chunk {
    ptr: Ptr,
    used: usize,
}

/// A pool of equally sized elements, created with
/// [`RawZone::batch_create`](../allocators/struct.RawZone.html#method.batch_create).
///
/// There is always room for at least one more element in the newest chunk.
#[derive(Debug)]
pub struct Batch {
    element_size: usize,
    batch_count: usize,
    tag: Tag,
    chunks: Vec<Chunk>,
}

impl Batch {
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of zone chunks the batch holds.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of elements handed out so far.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.used).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One element of a batch: `len` bytes at `offset` in a chunk's payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub chunk: Ptr,
    pub offset: usize,
    pub len: usize,
}

impl<G: HeapGrower> RawZone<G> {
    /// Create a batch of `element_size` byte elements, `batch_count` to a
    /// chunk. The first chunk is allocated right away.
    pub fn batch_create(&mut self, element_size: usize, batch_count: usize, tag: Tag) -> Batch {
        if element_size == 0 || batch_count == 0 {
            fatal(Fault::InvalidBatch {
                element_size,
                batch_count,
            });
        }
        if tag.is_purgeable() {
            fatal(Fault::OwnerRequired { op: "batch_create" });
        }

        let mut batch = Batch {
            element_size,
            batch_count,
            tag,
            chunks: Vec::new(),
        };
        self.add_chunk(&mut batch);
        batch
    }

    fn add_chunk(&mut self, batch: &mut Batch) {
        let size = batch.element_size * batch.batch_count;
        match self.allocate(size, batch.tag, None) {
            Some(ptr) => batch.chunks.push(Chunk { ptr, used: 0 }),
            None => fatal(Fault::InvalidBatch {
                element_size: batch.element_size,
                batch_count: batch.batch_count,
            }),
        }
    }

    /// Take the next element of the batch.
    pub fn batch_allocate(&mut self, batch: &mut Batch) -> Element {
        let (element_size, batch_count) = (batch.element_size, batch.batch_count);
        let chunk = match batch.chunks.last_mut() {
            Some(chunk) => chunk,
            None => fatal(Fault::InvalidBatch {
                element_size,
                batch_count,
            }),
        };

        let element = Element {
            chunk: chunk.ptr,
            offset: chunk.used * element_size,
            len: element_size,
        };
        chunk.used += 1;

        if chunk.used == batch_count {
            self.add_chunk(batch);
        }
        element
    }

    /// Release every chunk of the batch.
    ///
    /// Chunks of a sequenced tag form runs, and releasing one chunk frees its
    /// whole run, so chunks already gone with an earlier one are skipped.
    pub fn batch_destroy(&mut self, batch: Batch) {
        log::trace!(
            "Destroying batch of {} elements in {} chunks",
            batch.len(),
            batch.chunks.len()
        );
        let sequenced = batch.tag.is_sequenced();
        for chunk in batch.chunks {
            if sequenced && !self.is_live(chunk.ptr) {
                continue;
            }
            self.release(chunk.ptr);
        }
    }

    pub fn element_bytes(&self, element: &Element) -> &[u8] {
        &self.bytes(element.chunk)[element.offset..element.offset + element.len]
    }

    pub fn element_bytes_mut(&mut self, element: &Element) -> &mut [u8] {
        &mut self.bytes_mut(element.chunk)[element.offset..element.offset + element.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::allocators::{ToyHeap, Zone};
    use crate::config::ZoneConfig;

    fn toy_zone() -> RawZone<ToyHeap> {
        RawZone::new(ToyHeap::default(), ZoneConfig::default().with_volume_size(4096))
    }

    #[test]
    fn test_elements_are_consecutive() {
        let mut zone = toy_zone();
        let mut batch = zone.batch_create(12, 4, Tag::Map);
        assert_eq!(batch.chunk_count(), 1);
        assert!(batch.is_empty());

        let elements: Vec<Element> = (0..4).map(|_| zone.batch_allocate(&mut batch)).collect();
        for (i, element) in elements.iter().enumerate() {
            assert_eq!(element.chunk, elements[0].chunk);
            assert_eq!(element.offset, i * 12);
            assert_eq!(element.len, 12);
        }

        // Filling a chunk adds the next one straight away.
        assert_eq!(batch.chunk_count(), 2);
        let fifth = zone.batch_allocate(&mut batch);
        assert_ne!(fifth.chunk, elements[0].chunk);
        assert_eq!(fifth.offset, 0);
        assert_eq!(batch.len(), 5);
        zone.check_heap();
    }

    #[test]
    fn test_elements_do_not_overlap() {
        let mut zone = toy_zone();
        let mut batch = zone.batch_create(8, 3, Tag::GameStatic);
        let elements: Vec<Element> = (0..10).map(|_| zone.batch_allocate(&mut batch)).collect();

        for (i, element) in elements.iter().enumerate() {
            zone.element_bytes_mut(element)
                .iter_mut()
                .for_each(|b| *b = i as u8);
        }
        for (i, element) in elements.iter().enumerate() {
            assert!(zone.element_bytes(element).iter().all(|&b| b == i as u8));
        }
        assert_eq!(zone.get_tag(elements[9].chunk), Tag::GameStatic);
    }

    #[test]
    fn test_destroy_releases_chunks() {
        let mut zone = toy_zone();
        let before = zone.free_bytes_total();
        let mut batch = zone.batch_create(16, 8, Tag::Map);
        for _ in 0..20 {
            zone.batch_allocate(&mut batch);
        }
        assert_eq!(batch.chunk_count(), 3);
        assert!(zone.free_bytes_total() < before);

        zone.batch_destroy(batch);
        assert_eq!(zone.free_bytes_total(), before);
    }

    #[test]
    fn test_destroy_sequenced_batch() {
        let mut zone = toy_zone();
        let mut batch = zone.batch_create(16, 4, Tag::MapStatic);
        for _ in 0..10 {
            zone.batch_allocate(&mut batch);
        }
        assert_eq!(batch.chunk_count(), 3);
        assert!(zone.is_sequenced(batch.chunks[1].ptr));

        zone.batch_destroy(batch);
        assert_eq!(zone.free_bytes_total(), 4096);
        zone.check_heap();
    }

    #[test]
    fn test_locked_batch() {
        let zone = Zone::new(ToyHeap::default(), ZoneConfig::default().with_volume_size(4096));
        let mut batch = zone.batch_create(4, 2, Tag::Map);
        let element = zone.batch_allocate(&mut batch);
        zone.with_element(&element, |bytes| bytes.copy_from_slice(b"abcd"));
        assert_eq!(zone.with_element(&element, |bytes| bytes[3]), b'd');
        zone.batch_destroy(batch);
        assert_eq!(zone.free_bytes_total(), 4096);
    }

    #[test]
    #[should_panic(expected = "invalid batch")]
    fn test_zero_element_size() {
        toy_zone().batch_create(0, 8, Tag::Map);
    }

    #[test]
    #[should_panic(expected = "invalid batch")]
    fn test_zero_batch_count() {
        toy_zone().batch_create(8, 0, Tag::Map);
    }

    #[test]
    #[should_panic(expected = "batch_create: an owner is required")]
    fn test_purgeable_batch() {
        toy_zone().batch_create(8, 8, Tag::Cache);
    }

    #[test]
    #[should_panic(expected = "is not a live zone allocation")]
    fn test_chunks_released_behind_the_batch() {
        let mut zone = toy_zone();
        let batch = zone.batch_create(8, 8, Tag::Map);
        zone.release_tag_range(Tag::Map, Tag::Map);
        zone.batch_destroy(batch);
    }
}
