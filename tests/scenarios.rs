use std::sync::Arc;
use std::thread;

use tagged_zone::{OwnerSlot, Ptr, Tag, ToyHeap, Zone, ZoneConfig, HEADER_SIZE};

use test_env_log::test;

fn zone(volume_size: usize) -> Zone<ToyHeap> {
    Zone::new(
        ToyHeap::default(),
        ZoneConfig::default().with_volume_size(volume_size),
    )
}

#[test]
fn test_freed_region_is_reused() {
    // Just enough room for the first two allocations.
    let zone = zone(256);
    let first_slot = OwnerSlot::new();
    let first = zone.allocate(100, Tag::Cache, Some(&first_slot)).unwrap();
    let second_slot = OwnerSlot::new();
    zone.allocate(50, Tag::Cache, Some(&second_slot)).unwrap();
    zone.release(first);
    assert!(first_slot.is_empty());

    let third = zone.allocate(90, Tag::Cache, Some(&OwnerSlot::new())).unwrap();
    assert_eq!(third.volume(), 0);
    assert!(second_slot.get().is_some());
    assert_eq!(zone.stats().volumes, 1);
    zone.check_heap();
}

#[test]
fn test_purgeable_block_evicted_for_permanent_one() {
    let zone = zone(1024);
    let permanent: Vec<Ptr> = (0..4)
        .map(|_| zone.allocate(200, Tag::AppStatic, None).unwrap())
        .collect();

    let slot = OwnerSlot::new();
    let cached = zone.allocate(10, Tag::Cache, Some(&slot)).unwrap();
    assert_eq!(slot.get(), Some(cached));
    // The cache block took the last of the volume.
    assert_eq!(zone.stats().free_bytes, 0);

    let ptr = zone.allocate(60, Tag::AppStatic, None).unwrap();
    assert!(slot.is_empty());
    assert_eq!(ptr.volume(), 0);
    assert_eq!(zone.stats().volumes, 1);
    for ptr in permanent {
        assert_eq!(zone.get_tag(ptr), Tag::AppStatic);
    }
    zone.check_heap();
}

#[test]
fn test_releasing_sequence_member() {
    let zone = zone(4096);
    let members: Vec<Ptr> = (0..5)
        .map(|_| zone.allocate(64, Tag::MapStatic, None).unwrap())
        .collect();
    let block = 64 + HEADER_SIZE;
    assert_eq!(zone.free_bytes_total(), 4096 - 5 * block);

    // The whole run goes with any one of its members.
    zone.release(members[2]);
    zone.check_heap();
    assert_eq!(zone.free_bytes_total(), 4096);
    for &ptr in &members {
        assert!(!zone.is_live(ptr));
    }
}

#[test]
fn test_tag_sweep_keeps_longer_lifetimes() {
    let zone = zone(8192);
    let app = zone.allocate(128, Tag::AppStatic, None).unwrap();
    let game = zone.allocate(128, Tag::GameStatic, None).unwrap();
    for _ in 0..8 {
        zone.allocate(128, Tag::Map, None).unwrap();
        zone.allocate(128, Tag::MapStatic, None).unwrap();
    }

    zone.release_tag_range(Tag::Map, Tag::MapStatic);
    zone.check_heap();
    let stats = zone.stats();
    assert_eq!(stats.used_bytes, 2 * (128 + HEADER_SIZE));
    assert_eq!(zone.get_tag(app), Tag::AppStatic);
    assert_eq!(zone.get_tag(game), Tag::GameStatic);
}

#[test]
fn test_threads_share_zone() {
    let zone = Arc::new(zone(64 * 1024));

    let handles: Vec<_> = (0..4u8)
        .map(|n| {
            let zone = Arc::clone(&zone);
            thread::spawn(move || {
                for round in 0..100usize {
                    let size = 16 + (round % 7) * 24;
                    let ptr = zone.allocate(size, Tag::Map, None).unwrap();
                    zone.with_bytes(ptr, |bytes| bytes.iter_mut().for_each(|b| *b = n));
                    assert!(zone.with_bytes(ptr, |bytes| bytes.iter().all(|&b| b == n)));
                    zone.release(ptr);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(zone.stats().used_bytes, 0);
    zone.check_heap();
}
