//! Purge tags: the lifetime classes of zone blocks.

use core::convert::TryFrom;
use core::fmt;

use crate::fault::Fault;

/// The lifetime class of an allocation.
///
/// Tags are ordered by their purge level. Everything at or above
/// [`Tag::PurgeLevel`] may be evicted by the zone whenever it needs the space,
/// so such blocks must always be allocated with an owner slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Lives until the application shuts down.
    AppStatic = 1,
    /// Lives until the game is unloaded.
    GameStatic = 40,
    /// Freed when the current map ends.
    Map = 50,
    /// Like `Map`, but never freed while the map is in use. Consecutive
    /// map-static blocks are linked into sequences so scans can skip them as
    /// one unit.
    MapStatic = 52,
    /// The lowest purgeable level.
    PurgeLevel = 100,
    /// Cached data that can be thrown away at any time.
    Cache = 101,
}

/// All tags, in ascending purge order.
pub const TAGS: [Tag; 6] = [
    Tag::AppStatic,
    Tag::GameStatic,
    Tag::Map,
    Tag::MapStatic,
    Tag::PurgeLevel,
    Tag::Cache,
];

impl Tag {
    /// The numeric purge level of this tag.
    pub const fn level(self) -> i32 {
        self as i32
    }

    /// Whether blocks with this tag may be evicted to satisfy another
    /// allocation.
    pub fn is_purgeable(self) -> bool {
        self >= Tag::PurgeLevel
    }

    /// Whether blocks with this tag are linked into sequences.
    pub fn is_sequenced(self) -> bool {
        self == Tag::MapStatic
    }
}

impl TryFrom<i32> for Tag {
    type Error = Fault;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        TAGS.iter()
            .copied()
            .find(|tag| tag.level() == level)
            .ok_or(Fault::InvalidTag(level))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::AppStatic => "appstatic",
            Tag::GameStatic => "gamestatic",
            Tag::Map => "map",
            Tag::MapStatic => "mapstatic",
            Tag::PurgeLevel => "purgelevel",
            Tag::Cache => "cache",
        };
        write!(f, "{}({})", name, self.level())
    }
}
