//! A tagged zone allocator.
//!
//! The zone hands out byte blocks from large memory volumes. Every block
//! carries a purge [`Tag`] describing its lifetime class: whole classes can be
//! released at once with [`Zone::release_tag_range`], and blocks at or above
//! [`Tag::PurgeLevel`] may be evicted whenever the zone needs their space. The
//! owner of such a block holds an [`OwnerSlot`], which the zone clears when
//! the block goes away.
//!
//! Allocations are named by [`Ptr`] handles that carry a generation, so using
//! a block after it was released or evicted is detected rather than silently
//! reading someone else's memory.
//!
//! ```
//! use tagged_zone::{OwnerSlot, Tag, ToyHeap, Zone, ZoneConfig};
//!
//! let zone = Zone::new(ToyHeap::default(), ZoneConfig::default().with_volume_size(4096));
//!
//! let level = zone.allocate(256, Tag::Map, None).unwrap();
//! let slot = OwnerSlot::new();
//! let cached = zone.allocate(512, Tag::Cache, Some(&slot)).unwrap();
//! assert_eq!(slot.get(), Some(cached));
//!
//! zone.with_bytes(level, |bytes| bytes[0] = 1);
//!
//! // End of the map: drop everything tagged for it.
//! zone.release_tag_range(Tag::Map, Tag::MapStatic);
//! zone.release(cached);
//! assert!(slot.is_empty());
//! assert_eq!(zone.free_bytes_total(), 4096);
//! ```

pub mod allocators;
pub mod batch;
pub mod blocklist;
pub mod config;
pub mod fault;
pub mod owner;
pub mod ptr;
pub mod tag;
pub mod volume;

pub use allocators::{HeapGrower, RawZone, SystemHeap, ToyHeap, Zone};
pub use batch::{Batch, Element};
pub use blocklist::{Stats, HEADER_SIZE};
pub use config::ZoneConfig;
pub use fault::Fault;
pub use owner::OwnerSlot;
pub use ptr::Ptr;
pub use tag::Tag;
