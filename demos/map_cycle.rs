//! An example program that plays through a number of "maps", loading level
//! data with map tags, keeping a texture cache of purgeable blocks, and
//! sweeping each map's data away when it ends. The zone is checked along the
//! way.
//!
//! The volume size can be set with `ZONE_VOLUME_SIZE` (e.g. `ZONE_VOLUME_SIZE=4m`).

use tagged_zone::{OwnerSlot, SystemHeap, Tag, Zone, ZoneConfig};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// Number of maps to play through
const MAPS: usize = 16;
// Number of cached textures kept around between maps
const TEXTURES: usize = 64;
// Number of map elements loaded per map
const ELEMENTS: usize = 4096;

struct TextureCache {
    slots: Vec<OwnerSlot>,
    loads: usize,
}

impl TextureCache {
    fn new(count: usize) -> Self {
        TextureCache {
            slots: (0..count).map(|_| OwnerSlot::new()).collect(),
            loads: 0,
        }
    }

    // Make sure a texture is loaded, reloading it if the zone evicted it.
    fn touch<R: Rng>(&mut self, zone: &Zone<SystemHeap>, rng: &mut R) {
        let index = rng.gen_range(0, self.slots.len());
        let slot = &self.slots[index];
        if slot.get().is_some() {
            return;
        }

        let size = Uniform::new_inclusive(1usize, 64).sample(rng) * 1024;
        zone.allocate(size, Tag::Cache, Some(slot));
        self.loads += 1;
    }

    // Throw a texture away, as a renderer does when it resets part of its
    // cache.
    fn unload<R: Rng>(&mut self, zone: &Zone<SystemHeap>, rng: &mut R) {
        let index = rng.gen_range(0, self.slots.len());
        if let Some(ptr) = self.slots[index].take() {
            zone.release(ptr);
        }
    }

    fn resident(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_empty()).count()
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [MAPS] [ELEMENTS]", args[0]);
        return;
    }
    let maps: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAPS);
    let elements: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ELEMENTS);

    env_logger::init();
    let config = ZoneConfig::from_env();
    println!("Running Map Cycle.\n\nParameters:");
    println!("    {} maps", maps);
    println!("    {} elements per map", elements);
    println!("    {} byte volumes", config.volume_size);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let zone = Zone::new(SystemHeap::default(), config);
    zone.allocate(64 * 1024, Tag::AppStatic, None);
    zone.allocate(256 * 1024, Tag::GameStatic, None);

    let mut textures = TextureCache::new(TEXTURES);
    let lump_sizes = Uniform::new_inclusive(1usize, 32);

    for map in 1..=maps {
        // Geometry, kept for the whole map.
        let mut vertices = zone.batch_create(16, 512, Tag::MapStatic);
        for i in 0..elements {
            let vertex = zone.batch_allocate(&mut vertices);
            zone.with_element(&vertex, |bytes| {
                bytes[..8].copy_from_slice(&(i as u64).to_le_bytes())
            });
        }

        // Lumps loaded while the map is played.
        for _ in 0..rng.gen_range(16, 128) {
            let size = lump_sizes.sample(&mut rng) * lump_sizes.sample(&mut rng) * 64;
            zone.allocate_zeroed(size, Tag::Map, None);
            textures.touch(&zone, &mut rng);
        }

        zone.check_heap();
        let stats = zone.stats();
        println!("Map {} / {}", map, maps);
        println!("    Zone stats: {:?}", stats);
        println!(
            "    Textures resident: {} / {}, loads: {}",
            textures.resident(),
            TEXTURES,
            textures.loads
        );

        for _ in 0..rng.gen_range(0, 8) {
            textures.unload(&zone, &mut rng);
        }

        // End of the map. The vertex chunks go with the sweep.
        zone.release_tag_range(Tag::Map, Tag::MapStatic);
        drop(vertices);
        zone.check_heap();
    }

    println!("\nFinished.");
    println!("    Free bytes: {}", zone.free_bytes_total());
    let heap = zone.shutdown();
    println!("    Heap: {:?}", heap);
}
