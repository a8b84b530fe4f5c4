//! Inode allocation queries.
//!
//! Answers questions about which logical ranges of a VDI are backed by
//! objects, using only the owner table of a loaded inode.

use sheepdog_proto::inode::SdInode;

/// Allocation state of a run of bytes starting at a queried offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    /// Whether the run is backed by objects.
    pub allocated: bool,
    /// Length of the run in bytes, at most the queried length.
    pub len: u64,
}

/// Find the longest run starting at `offset` whose objects are uniformly
/// allocated or unallocated. Ranges past the end of the VDI are clipped.
pub fn block_status(inode: &SdInode, offset: u64, len: u64) -> BlockStatus {
    let obj_size = inode.object_size();
    let end = offset.saturating_add(len).min(inode.vdi_size);
    if offset >= end {
        return BlockStatus {
            allocated: false,
            len: 0,
        };
    }

    let start_idx = offset / obj_size;
    let last_idx = (end - 1) / obj_size;
    let allocated = inode.get_vid(start_idx) != 0;

    let mut idx = start_idx + 1;
    while idx <= last_idx && (inode.get_vid(idx) != 0) == allocated {
        idx += 1;
    }

    let run_end = (idx * obj_size).min(end);
    BlockStatus {
        allocated,
        len: run_end - offset,
    }
}

/// Count the number of allocated data objects in the inode.
pub fn inode_count_allocated(inode: &SdInode) -> u64 {
    let nr_objs = inode.count_data_objs() as usize;
    inode
        .data_vdi_id
        .iter()
        .take(nr_objs)
        .filter(|&&v| v != 0)
        .count() as u64
}

/// Bytes of storage backing the VDI, counting whole objects.
pub fn allocated_size(inode: &SdInode) -> u64 {
    inode_count_allocated(inode) * inode.object_size()
}

/// Collect statistics about the inode's data allocation:
/// objects owned by this VDI and objects still shared with an ancestor.
pub fn inode_stat(inode: &SdInode) -> (u64, u64) {
    let mut my_objs: u64 = 0;
    let mut cow_objs: u64 = 0;

    for idx in 0..inode.count_data_objs() {
        match inode.get_vid(idx) {
            0 => {}
            vid if vid == inode.vdi_id => my_objs += 1,
            _ => cow_objs += 1,
        }
    }

    (my_objs, cow_objs)
}
