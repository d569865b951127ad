//! Zone configuration.

use crate::blocklist::HEADER_SIZE;

/// Size of one memory volume, unless a request needs more.
pub const DEFAULT_VOLUME_SIZE: usize = 0x200_0000; // 32 MiB

/// Spare room added when a volume is created for one oversized request.
pub const DEFAULT_GROWTH_SLACK: usize = 0x1000;

/// A free remainder no larger than this stays part of the allocated block
/// instead of becoming a free block of its own.
pub const DEFAULT_MIN_FRAGMENT: usize = HEADER_SIZE + 32;

/// Environment variable read by [`ZoneConfig::from_env`].
pub const VOLUME_SIZE_VAR: &str = "ZONE_VOLUME_SIZE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneConfig {
    pub volume_size: usize,
    pub growth_slack: usize,
    pub min_fragment: usize,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            volume_size: DEFAULT_VOLUME_SIZE,
            growth_slack: DEFAULT_GROWTH_SLACK,
            min_fragment: DEFAULT_MIN_FRAGMENT,
        }
    }
}

impl ZoneConfig {
    /// Defaults, with the volume size taken from `ZONE_VOLUME_SIZE` if it is
    /// set to something [`parse_size`] understands.
    pub fn from_env() -> Self {
        let mut config = ZoneConfig::default();
        if let Ok(value) = std::env::var(VOLUME_SIZE_VAR) {
            match parse_size(&value) {
                Some(size) if size > 0 => config.volume_size = size,
                _ => log::warn!("Ignoring {}={:?}", VOLUME_SIZE_VAR, value),
            }
        }
        config
    }

    pub fn with_volume_size(mut self, volume_size: usize) -> Self {
        self.volume_size = volume_size;
        self
    }

    pub fn with_growth_slack(mut self, growth_slack: usize) -> Self {
        self.growth_slack = growth_slack;
        self
    }

    pub fn with_min_fragment(mut self, min_fragment: usize) -> Self {
        self.min_fragment = min_fragment;
        self
    }
}

/// Parse a byte count such as `4096`, `0x1000`, `512k` or `32M`.
///
/// A `0x` prefix means hexadecimal and a leading `0` octal. A trailing `k` or
/// `m` (either case) multiplies by 1024 or 1024 * 1024.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, scale) = match text.as_bytes().last()? {
        b'k' | b'K' => (&text[..text.len() - 1], 1024),
        b'm' | b'M' => (&text[..text.len() - 1], 1024 * 1024),
        _ => (text, 1),
    };

    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        usize::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        usize::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse().ok()?
    };

    value.checked_mul(scale)
}
