//! NAND array geometry, immutable after init.

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NandType {
    Slc,
    Mlc,
    Tlc,
}

impl NandType {
    /// Bits stored per cell; pages sharing a wordline.
    pub fn bits_per_cell(self) -> u32 {
        match self {
            NandType::Slc => 1,
            NandType::Mlc => 2,
            NandType::Tlc => 3,
        }
    }
}

/// One axis of the physical array. The order in
/// [`Geometry::page_allocation_order`] decides how sequentially ascending
/// PPNs spread across the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrAxis {
    Channel,
    Way,
    Die,
    Plane,
}

pub const ALL_AXES: [AddrAxis; 4] = [
    AddrAxis::Channel,
    AddrAxis::Way,
    AddrAxis::Die,
    AddrAxis::Plane,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub channels: u32,
    pub ways_per_channel: u32,
    pub dies_per_way: u32,
    pub planes_per_die: u32,
    pub blocks_per_plane: u32,
    pub pages_per_block: u32,
    pub page_size_bytes: u32,
    pub nand_type: NandType,
    /// Channel DMA rate in MT/s.
    pub dma_speed_mtps: u32,
    /// Channel width in bits, a multiple of 8.
    pub dma_width_bits: u32,
    /// Physical blocks fused into one logical superblock.
    pub superblock_degree: u32,
    pub page_allocation_order: [AddrAxis; 4],
    pub use_multi_plane: bool,
}

impl Geometry {
    /// Validate every geometry invariant. Called once at config load; the
    /// struct is treated as immutable afterwards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("NumChannel", self.channels),
            ("NumPackage", self.ways_per_channel),
            ("NumDie", self.dies_per_way),
            ("NumPlane", self.planes_per_die),
            ("NumBlock", self.blocks_per_plane),
            ("NumPage", self.pages_per_block),
            ("SizePage", self.page_size_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    key: name,
                    reason: "must be >= 1",
                });
            }
        }

        if self.dma_width_bits == 0 || self.dma_width_bits % 8 != 0 {
            return Err(ConfigError::OutOfRange {
                key: "DMAWidth",
                reason: "must be a non-zero multiple of 8",
            });
        }

        for axis in ALL_AXES {
            if !self.page_allocation_order.contains(&axis) {
                return Err(ConfigError::BadAllocationOrder);
            }
        }

        if self.use_multi_plane && self.page_allocation_order[0] != AddrAxis::Plane {
            return Err(ConfigError::OutOfRange {
                key: "AddrRemap_PLANE",
                reason: "multi-plane operation requires the plane axis first",
            });
        }

        if self.superblock_degree == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SuperblockDegree",
                reason: "must be >= 1",
            });
        }

        self.superblock_axes()?;

        Ok(())
    }

    pub fn axis_size(&self, axis: AddrAxis) -> u32 {
        match axis {
            AddrAxis::Channel => self.channels,
            AddrAxis::Way => self.ways_per_channel,
            AddrAxis::Die => self.dies_per_way,
            AddrAxis::Plane => self.planes_per_die,
        }
    }

    /// The prefix of `page_allocation_order` fused into superblocks. The
    /// degree must be exactly the product of a prefix of the allocation
    /// order so that one superblock stripes evenly over whole axes.
    pub fn superblock_axes(&self) -> Result<&[AddrAxis], ConfigError> {
        let mut product = 1u64;

        for (idx, axis) in self.page_allocation_order.iter().enumerate() {
            if product == u64::from(self.superblock_degree) {
                return Ok(&self.page_allocation_order[..idx]);
            }

            product *= u64::from(self.axis_size(*axis));
        }

        if product == u64::from(self.superblock_degree) {
            return Ok(&self.page_allocation_order[..]);
        }

        Err(ConfigError::OutOfRange {
            key: "SuperblockDegree",
            reason: "must be the product of a prefix of the page allocation order",
        })
    }

    pub fn total_dies(&self) -> u64 {
        u64::from(self.channels) * u64::from(self.ways_per_channel) * u64::from(self.dies_per_way)
    }

    pub fn total_planes(&self) -> u64 {
        self.total_dies() * u64::from(self.planes_per_die)
    }

    /// Physical blocks across the whole array.
    pub fn total_physical_blocks(&self) -> u64 {
        self.total_planes() * u64::from(self.blocks_per_plane)
    }

    /// Logical superblocks visible to the FTL.
    pub fn total_superblocks(&self) -> u64 {
        self.total_physical_blocks() / u64::from(self.superblock_degree)
    }

    /// Pages in one superpage (one FTL page slot): one page per fused block.
    pub fn pages_in_superpage(&self) -> u32 {
        self.superblock_degree
    }

    pub fn superpage_size_bytes(&self) -> u64 {
        u64::from(self.page_size_bytes) * u64::from(self.superblock_degree)
    }

    pub fn total_physical_pages(&self) -> u64 {
        self.total_physical_blocks() * u64::from(self.pages_per_block)
    }

    pub fn is_power_of_two(&self) -> bool {
        [
            self.channels,
            self.ways_per_channel,
            self.dies_per_way,
            self.planes_per_die,
            self.blocks_per_plane,
            self.pages_per_block,
        ]
        .iter()
        .all(|v| v.is_power_of_two())
    }
}
