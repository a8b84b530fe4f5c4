/// Sheepdog client protocol constants.

/// Client protocol version
pub const SD_PROTO_VER: u8 = 0x01;

/// Default listen port for client connections
pub const SD_LISTEN_PORT: u16 = 7000;
/// Default daemon host
pub const SD_DEFAULT_ADDR: &str = "localhost";

/// Default number of copies
pub const SD_DEFAULT_COPIES: u8 = 3;
/// Maximum erasure coding data strips
pub const SD_EC_MAX_STRIP: u8 = 16;
/// Maximum copies (15 parity + 16 data strips)
pub const SD_MAX_COPIES: u8 = SD_EC_MAX_STRIP * 2 - 1;

/// Default block size shift (4 MB objects)
pub const SD_DEFAULT_BLOCK_SIZE_SHIFT: u8 = 22;
/// Smallest accepted object size (1 MB)
pub const SD_MIN_BLOCK_SIZE_SHIFT: u8 = 20;
/// Largest accepted object size (2 GB)
pub const SD_MAX_BLOCK_SIZE_SHIFT: u8 = 31;
/// Data object size for the default block size shift
pub const SD_DATA_OBJ_SIZE: u64 = 1 << SD_DEFAULT_BLOCK_SIZE_SHIFT;

/// Maximum data objects per VDI (2^20)
pub const MAX_DATA_OBJS: u64 = 1 << 20;
/// Maximum children recorded in an inode
pub const MAX_CHILDREN: usize = 1024;

/// Maximum VDI name length
pub const SD_MAX_VDI_LEN: usize = 256;
/// Maximum VDI tag length
pub const SD_MAX_VDI_TAG_LEN: usize = 256;

/// Total number of VDIs (2^24 = 16M)
pub const SD_NR_VDIS: u32 = 1 << 24;

/// Maximum VDI size for 4 MB objects (4 TB)
pub const SD_MAX_VDI_SIZE: u64 = SD_DATA_OBJ_SIZE * MAX_DATA_OBJS;

/// Lock types for VDI operations
pub const LOCK_TYPE_NORMAL: u32 = 0;
pub const LOCK_TYPE_SHARED: u32 = 1;
