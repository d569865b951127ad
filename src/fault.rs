//! Allocator faults.
//!
//! A zone that detects misuse or corruption cannot be trusted to continue, so
//! every fault is fatal: it is logged and then raised as a panic. The zone's
//! lock is released while unwinding, but callers are not expected to recover.

use thiserror::Error;

use crate::blocklist::BlockId;
use crate::ptr::Ptr;

/// Everything that can go fatally wrong inside the zone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A raw purge level that does not name a tag.
    #[error("invalid purge level {0}")]
    InvalidTag(i32),

    /// A purgeable block must have an owner the zone can notify.
    #[error("{op}: an owner is required for purgeable blocks")]
    OwnerRequired { op: &'static str },

    /// The handle does not refer to a live block (already released, evicted,
    /// or never allocated).
    #[error("{op}: {ptr:?} is not a live zone allocation")]
    NotLive { op: &'static str, ptr: Ptr },

    /// The platform refused to supply a new volume.
    #[error("could not obtain a {size} byte memory volume: {reason}")]
    VolumeUnavailable { size: usize, reason: String },

    /// A freshly created volume could not hold the request it was made for.
    #[error("new volume {volume} cannot hold a {size} byte block")]
    VolumeTooSmall { volume: usize, size: usize },

    #[error("invalid batch: element size {element_size}, batch count {batch_count}")]
    InvalidBatch {
        element_size: usize,
        batch_count: usize,
    },

    #[error("volume {volume}: zero-size block {block:?}")]
    ZeroSizeBlock { volume: usize, block: BlockId },

    #[error("volume {volume}: block {block:?} size does not touch the next block")]
    BlockGap { volume: usize, block: BlockId },

    #[error("volume {volume}: block list does not start at the volume start")]
    BadStart { volume: usize },

    #[error("volume {volume}: block {block:?} has no proper back link")]
    BadBackLink { volume: usize, block: BlockId },

    #[error("volume {volume}: block ring does not close")]
    BrokenRing { volume: usize },

    #[error("volume {volume}: two consecutive free blocks at {block:?}")]
    ConsecutiveFree { volume: usize, block: BlockId },

    #[error("volume {volume}: block {block:?} owner does not match its tag")]
    OwnerMismatch { volume: usize, block: BlockId },

    #[error("volume {volume}: purgeable block {block:?} has no owner")]
    OwnerlessPurgeable { volume: usize, block: BlockId },

    #[error("volume {volume}: block {block:?} points at a sequence head that is not one")]
    BadSequenceHead { volume: usize, block: BlockId },

    #[error("volume {volume}: disconnected sequence at {block:?}")]
    DisconnectedSequence { volume: usize, block: BlockId },
}

/// Report a fault and stop.
#[cold]
#[track_caller]
pub fn fatal(fault: Fault) -> ! {
    log::error!("{}", fault);
    panic!("{}", fault)
}
