//! VM tunables
//!
//! Everything the resident page manager and the mapping layer can be tuned
//! with at bootstrap. Defaults match a desktop configuration; embedded
//! targets typically shrink the speculative geometry and disable the 32-bit
//! placement flag.

use thiserror::Error;

use crate::mach_vm::vm_page::PAGE_SIZE;

/// Upper bound on the number of free-queue colors
pub const MAX_COLORS: u32 = 128;

/// Upper bound on protected speculative bins (the state word holds 6 bits)
pub const MAX_SPECULATIVE_BINS: u32 = 62;

/// Upper bound on CPUs with local queues (the state word holds 6 bits)
pub const MAX_CPUS: usize = 64;

/// Pages processed per residency-query chunk, and the size of the
/// transient buffer backing one chunk
pub const MAX_RESIDENCY_CHUNK_PAGES: usize = 1024;

/// Cache geometry used to derive the page-color count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    /// Size of the last-level cache in bytes
    pub size: u64,
    /// Set associativity
    pub associativity: u32,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        // 2 MiB, 16-way: 32 colors of 4 KiB pages
        Self {
            size: 2 * 1024 * 1024,
            associativity: 16,
        }
    }
}

impl CacheGeometry {
    /// Number of page colors for this cache
    ///
    /// One color per page-sized slice of a cache way, rounded down to a
    /// power of two and clamped to `1..=MAX_COLORS`.
    pub fn colors(&self) -> u32 {
        let way = self.size / u64::from(self.associativity.max(1));
        let raw = (way / PAGE_SIZE as u64).clamp(1, u64::from(MAX_COLORS)) as u32;
        1 << (31 - raw.leading_zeros())
    }
}

/// Low/high water marks of an auxiliary queue, in per-mille of the
/// managed page count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterMarkRatio {
    pub low_per_mille: u32,
    pub high_per_mille: u32,
}

impl WaterMarkRatio {
    pub const fn new(low_per_mille: u32, high_per_mille: u32) -> Self {
        Self {
            low_per_mille,
            high_per_mille,
        }
    }
}

/// Platform flavor, gating platform-specific mmap flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Desktop: the 32-bit placement flag is honored
    Desktop,
    /// Embedded: the 32-bit placement flag is not applicable
    Embedded,
}

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("page color count {0} is not a power of two in 1..=128")]
    BadColorCount(u32),
    #[error("speculative bin count {0} outside 1..=62")]
    BadSpeculativeBins(u32),
    #[error("speculative bin interval must be non-zero")]
    ZeroBinInterval,
    #[error("cpu count {0} outside 1..=64")]
    BadCpuCount(usize),
    #[error("residency chunk of {0} pages outside 1..=1024")]
    BadResidencyChunk(usize),
    #[error("map bounds {min:#x}..{max:#x} are empty or not page aligned")]
    BadMapBounds { min: u64, max: u64 },
    #[error("water marks low {low} > high {high}")]
    BadWaterMarks { low: u32, high: u32 },
    #[error("no physical memory to manage")]
    NoMemory,
    #[error("physical memory ranges overlap at page {0:#x}")]
    OverlappingRam(u64),
    #[error("too many descriptors for the packing scheme")]
    TooManyPages,
}

/// VM configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Cache geometry for color derivation
    pub cache: CacheGeometry,
    /// Explicit color count (power of two), overriding the cache geometry
    pub page_colors: Option<u32>,
    /// Number of protected speculative bins
    pub speculative_bins: u32,
    /// Milliseconds a speculative bin stays current
    pub speculative_bin_ms: u64,
    /// CPUs with local queues
    pub cpus: usize,
    /// Pages moved per local free-queue refill
    pub local_free_batch: usize,
    /// Frames below this physical page number go to the low-page queue
    pub lopage_limit: u32,
    /// Capacity of the auxiliary descriptor zone
    pub aux_zone_capacity: usize,
    /// Secluded queue water marks
    pub secluded_marks: WaterMarkRatio,
    /// Throttled queue water marks
    pub throttled_marks: WaterMarkRatio,
    /// Background queue water marks
    pub background_marks: WaterMarkRatio,
    /// Donate queue water marks
    pub donate_marks: WaterMarkRatio,
    /// Lowest user address
    pub map_min: u64,
    /// One past the highest user address
    pub map_max: u64,
    /// Entry limit per map
    pub max_map_entries: usize,
    /// Pages per residency-query chunk
    pub residency_chunk_pages: usize,
    /// Reclaim rounds a wiring fault may run before giving up
    pub wire_reclaim_attempts: u32,
    /// Platform flavor
    pub platform: Platform,
    /// ABI level from which unknown mmap flags are rejected
    pub strict_flags_sdk: u32,
    /// Refuse writable+executable protections outside JIT regions
    pub enforce_wx: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cache: CacheGeometry::default(),
            page_colors: None,
            speculative_bins: 10,
            speculative_bin_ms: 500,
            cpus: 1,
            local_free_batch: 16,
            lopage_limit: 0,
            aux_zone_capacity: 1024,
            secluded_marks: WaterMarkRatio::new(10, 50),
            throttled_marks: WaterMarkRatio::new(0, 20),
            background_marks: WaterMarkRatio::new(5, 100),
            donate_marks: WaterMarkRatio::new(5, 100),
            map_min: PAGE_SIZE as u64,
            map_max: 0x0000_7FFF_FFFF_F000,
            max_map_entries: 65_536,
            residency_chunk_pages: MAX_RESIDENCY_CHUNK_PAGES,
            wire_reclaim_attempts: 3,
            platform: Platform::Desktop,
            strict_flags_sdk: 0x000A_0F00,
            enforce_wx: true,
        }
    }
}

impl VmConfig {
    pub fn with_page_colors(mut self, colors: u32) -> Self {
        self.page_colors = Some(colors);
        self
    }

    pub fn with_cache(mut self, cache: CacheGeometry) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_speculative(mut self, bins: u32, bin_ms: u64) -> Self {
        self.speculative_bins = bins;
        self.speculative_bin_ms = bin_ms;
        self
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_local_free_batch(mut self, batch: usize) -> Self {
        self.local_free_batch = batch;
        self
    }

    pub fn with_lopage_limit(mut self, limit: u32) -> Self {
        self.lopage_limit = limit;
        self
    }

    pub fn with_aux_zone_capacity(mut self, capacity: usize) -> Self {
        self.aux_zone_capacity = capacity;
        self
    }

    pub fn with_map_bounds(mut self, min: u64, max: u64) -> Self {
        self.map_min = min;
        self.map_max = max;
        self
    }

    pub fn with_max_map_entries(mut self, max: usize) -> Self {
        self.max_map_entries = max;
        self
    }

    pub fn with_residency_chunk_pages(mut self, pages: usize) -> Self {
        self.residency_chunk_pages = pages;
        self
    }

    pub fn with_wire_reclaim_attempts(mut self, attempts: u32) -> Self {
        self.wire_reclaim_attempts = attempts;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_enforce_wx(mut self, enforce: bool) -> Self {
        self.enforce_wx = enforce;
        self
    }

    /// Effective color count
    pub fn colors(&self) -> u32 {
        self.page_colors.unwrap_or_else(|| self.cache.colors())
    }

    /// Check every tunable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let colors = self.colors();
        if colors == 0 || colors > MAX_COLORS || !colors.is_power_of_two() {
            return Err(ConfigError::BadColorCount(colors));
        }
        if self.speculative_bins == 0 || self.speculative_bins > MAX_SPECULATIVE_BINS {
            return Err(ConfigError::BadSpeculativeBins(self.speculative_bins));
        }
        if self.speculative_bin_ms == 0 {
            return Err(ConfigError::ZeroBinInterval);
        }
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::BadCpuCount(self.cpus));
        }
        if self.residency_chunk_pages == 0
            || self.residency_chunk_pages > MAX_RESIDENCY_CHUNK_PAGES
        {
            return Err(ConfigError::BadResidencyChunk(self.residency_chunk_pages));
        }
        let mask = PAGE_SIZE as u64 - 1;
        if self.map_min >= self.map_max || self.map_min & mask != 0 || self.map_max & mask != 0 {
            return Err(ConfigError::BadMapBounds {
                min: self.map_min,
                max: self.map_max,
            });
        }
        for marks in [
            self.secluded_marks,
            self.throttled_marks,
            self.background_marks,
            self.donate_marks,
        ] {
            if marks.low_per_mille > marks.high_per_mille {
                return Err(ConfigError::BadWaterMarks {
                    low: marks.low_per_mille,
                    high: marks.high_per_mille,
                });
            }
        }
        Ok(())
    }
}
