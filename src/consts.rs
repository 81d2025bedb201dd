use std::time::Duration;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SHIFT: u32 = 12;

/// Longest accepted device name, including the terminator of the C interface.
pub const VDUSE_NAME_MAX: usize = 256;
pub const VDUSE_MAX_CONFIG_SIZE: u32 = PAGE_SIZE as u32;
pub const VDUSE_MAX_VQ_ALIGN: u32 = PAGE_SIZE as u32;
pub const VDUSE_MAX_VQ_NUM: u32 = 0xffff;
/// Number of minors available for device nodes.
pub const VDUSE_DEV_MAX: u32 = 1 << 20;

pub const VDUSE_MIN_BOUNCE_SIZE: u64 = 1024 * 1024;
pub const VDUSE_BOUNCE_SIZE: u64 = 64 * 1024 * 1024;
pub const VDUSE_MAX_BOUNCE_SIZE: u64 = 1024 * 1024 * 1024;
/// Size of the IOVA space of a domain: the bounce area followed by coherent mappings.
pub const VDUSE_IOVA_SIZE: u64 = VDUSE_MAX_BOUNCE_SIZE + 128 * 1024 * 1024;

pub const VDUSE_MSG_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The first page frame handed out by the IOVA allocators. IOVA 0 is never mapped.
pub const IOVA_START_PFN: u64 = 1;

pub const PACKED_IDX_MASK: u16 = 0x7fff;
pub const WRAP_COUNTER_MASK: u16 = 0x0001;
