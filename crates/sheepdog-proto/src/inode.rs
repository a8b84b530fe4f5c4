//! VDI inode and its on-disk layout.
//!
//! The inode is stored as the VDI object of its vdi id. The layout is a
//! fixed little-endian record: a 4664-byte header (names, timestamps,
//! sizes, policies, ids and the child list) followed by the owner table,
//! one `u32` vdi id per data object index.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{SdError, SdResult};

const OFF_TAG: usize = SD_MAX_VDI_LEN;
const OFF_CTIME: usize = OFF_TAG + SD_MAX_VDI_TAG_LEN;
const OFF_SNAP_CTIME: usize = OFF_CTIME + 8;
const OFF_VM_CLOCK: usize = OFF_SNAP_CTIME + 8;
const OFF_VDI_SIZE: usize = OFF_VM_CLOCK + 8;
const OFF_VM_STATE_SIZE: usize = OFF_VDI_SIZE + 8;
const OFF_COPY_POLICY: usize = OFF_VM_STATE_SIZE + 8;
const OFF_STORE_POLICY: usize = OFF_COPY_POLICY + 1;
const OFF_NR_COPIES: usize = OFF_STORE_POLICY + 1;
const OFF_BLOCK_SHIFT: usize = OFF_NR_COPIES + 1;
const OFF_SNAP_ID: usize = OFF_BLOCK_SHIFT + 1;
const OFF_VDI_ID: usize = OFF_SNAP_ID + 4;
const OFF_PARENT: usize = OFF_VDI_ID + 4;
const OFF_CHILDREN: usize = OFF_PARENT + 4;

/// Size of the inode header, i.e. the offset of the owner table.
pub const SD_INODE_HEADER_SIZE: usize = OFF_CHILDREN + MAX_CHILDREN * 4;
/// Size of a complete inode object.
pub const SD_INODE_SIZE: usize = SD_INODE_HEADER_SIZE + MAX_DATA_OBJS as usize * 4;

/// VDI inode: the metadata record of a VDI or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdInode {
    /// VDI name (up to 256 bytes)
    pub name: String,
    /// Snapshot tag
    pub tag: String,
    /// Creation timestamp (seconds << 32 | nanoseconds)
    pub create_time: u64,
    /// Snapshot creation time, zero for a writable VDI
    pub snap_ctime: u64,
    /// VM clock in nanoseconds
    pub vm_clock_nsec: u64,
    /// Virtual disk size in bytes
    pub vdi_size: u64,
    /// VM state size
    pub vm_state_size: u64,
    /// Copy policy (0 = replicate, >0 = erasure coding scheme)
    pub copy_policy: u8,
    /// Store policy
    pub store_policy: u8,
    /// Number of replicas
    pub nr_copies: u8,
    /// Block size shift (log2 of object size)
    pub block_size_shift: u8,
    /// Snapshot ID
    pub snap_id: u32,
    /// VDI ID
    pub vdi_id: u32,
    /// Parent VDI ID (for snapshots/clones)
    pub parent_vdi_id: u32,
    /// Child VDI ids, at most `MAX_CHILDREN`
    pub child_vdi_id: Vec<u32>,
    /// Owner table: data object index → VDI id backing it (0 = unallocated).
    /// Empty for header-only inodes.
    pub data_vdi_id: Vec<u32>,
}

impl SdInode {
    /// Create a new empty inode.
    pub fn new() -> Self {
        Self {
            name: String::new(),
            tag: String::new(),
            create_time: 0,
            snap_ctime: 0,
            vm_clock_nsec: 0,
            vdi_size: 0,
            vm_state_size: 0,
            copy_policy: 0,
            store_policy: 0,
            nr_copies: 0,
            block_size_shift: SD_DEFAULT_BLOCK_SIZE_SHIFT,
            snap_id: 0,
            vdi_id: 0,
            parent_vdi_id: 0,
            child_vdi_id: Vec::new(),
            data_vdi_id: Vec::new(),
        }
    }

    /// Check if this inode represents a snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.snap_ctime != 0
    }

    /// Object size in bytes.
    pub fn object_size(&self) -> u64 {
        1u64 << self.block_size_shift
    }

    /// Largest VDI size this inode's object size can address.
    pub fn max_vdi_size(&self) -> u64 {
        self.object_size() * MAX_DATA_OBJS
    }

    /// Count the number of data objects needed for this VDI.
    pub fn count_data_objs(&self) -> u64 {
        crate::oid::ObjectId::count_data_objs(self.vdi_size, self.block_size_shift)
    }

    /// Get the VDI id owning the data object at the given index.
    pub fn get_vid(&self, idx: u64) -> u32 {
        self.data_vdi_id.get(idx as usize).copied().unwrap_or(0)
    }

    /// Set the VDI id owning the data object at the given index.
    pub fn set_vid(&mut self, idx: u64, vid: u32) {
        debug_assert!(idx < MAX_DATA_OBJS, "data index {idx} out of range");
        let idx = idx as usize;
        if idx >= self.data_vdi_id.len() {
            self.data_vdi_id.resize(idx + 1, 0);
        }
        self.data_vdi_id[idx] = vid;
    }

    /// An object may be written in place only if this VDI owns it.
    pub fn is_data_obj_writable(&self, idx: u64) -> bool {
        self.get_vid(idx) == self.vdi_id
    }

    /// Byte offset of the owner table entry for `idx` within the inode object.
    pub fn owner_entry_offset(idx: u64) -> u64 {
        SD_INODE_HEADER_SIZE as u64 + idx * 4
    }

    /// Encode owner table entries `min..=max`, as stored in the inode object.
    pub fn encode_owner_range(&self, min: u64, max: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(((max - min + 1) * 4) as usize);
        for idx in min..=max {
            buf.extend_from_slice(&self.get_vid(idx).to_le_bytes());
        }
        buf
    }

    /// Replace the header fields with those of `other`, keeping the
    /// owner table.
    pub fn apply_header(&mut self, other: &SdInode) {
        let data = std::mem::take(&mut self.data_vdi_id);
        *self = SdInode {
            data_vdi_id: data,
            ..other.header_clone()
        };
    }

    /// Copy of the header fields with an empty owner table.
    pub fn header_clone(&self) -> SdInode {
        SdInode {
            name: self.name.clone(),
            tag: self.tag.clone(),
            child_vdi_id: self.child_vdi_id.clone(),
            data_vdi_id: Vec::new(),
            ..*self
        }
    }

    /// Encode the header prefix.
    pub fn encode_header(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SD_INODE_HEADER_SIZE];
        put_str(&mut buf[..OFF_TAG], &self.name);
        put_str(&mut buf[OFF_TAG..OFF_CTIME], &self.tag);
        buf[OFF_CTIME..OFF_CTIME + 8].copy_from_slice(&self.create_time.to_le_bytes());
        buf[OFF_SNAP_CTIME..OFF_SNAP_CTIME + 8].copy_from_slice(&self.snap_ctime.to_le_bytes());
        buf[OFF_VM_CLOCK..OFF_VM_CLOCK + 8].copy_from_slice(&self.vm_clock_nsec.to_le_bytes());
        buf[OFF_VDI_SIZE..OFF_VDI_SIZE + 8].copy_from_slice(&self.vdi_size.to_le_bytes());
        buf[OFF_VM_STATE_SIZE..OFF_VM_STATE_SIZE + 8]
            .copy_from_slice(&self.vm_state_size.to_le_bytes());
        buf[OFF_COPY_POLICY] = self.copy_policy;
        buf[OFF_STORE_POLICY] = self.store_policy;
        buf[OFF_NR_COPIES] = self.nr_copies;
        buf[OFF_BLOCK_SHIFT] = self.block_size_shift;
        buf[OFF_SNAP_ID..OFF_SNAP_ID + 4].copy_from_slice(&self.snap_id.to_le_bytes());
        buf[OFF_VDI_ID..OFF_VDI_ID + 4].copy_from_slice(&self.vdi_id.to_le_bytes());
        buf[OFF_PARENT..OFF_PARENT + 4].copy_from_slice(&self.parent_vdi_id.to_le_bytes());
        for (i, child) in self.child_vdi_id.iter().take(MAX_CHILDREN).enumerate() {
            let off = OFF_CHILDREN + i * 4;
            buf[off..off + 4].copy_from_slice(&child.to_le_bytes());
        }
        buf
    }

    /// Encode the complete inode object.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.encode_header();
        buf.reserve(SD_INODE_SIZE - SD_INODE_HEADER_SIZE);
        for idx in 0..MAX_DATA_OBJS {
            buf.extend_from_slice(&self.get_vid(idx).to_le_bytes());
        }
        buf
    }

    /// Decode a header-only inode. The owner table is left empty.
    pub fn decode_header(buf: &[u8]) -> SdResult<Self> {
        if buf.len() < SD_INODE_HEADER_SIZE {
            return Err(SdError::InvalidParms);
        }
        let child_vdi_id = buf[OFF_CHILDREN..SD_INODE_HEADER_SIZE]
            .chunks_exact(4)
            .map(le_u32)
            .take_while(|&vid| vid != 0)
            .collect();
        Ok(Self {
            name: get_str(&buf[..OFF_TAG]),
            tag: get_str(&buf[OFF_TAG..OFF_CTIME]),
            create_time: le_u64(&buf[OFF_CTIME..]),
            snap_ctime: le_u64(&buf[OFF_SNAP_CTIME..]),
            vm_clock_nsec: le_u64(&buf[OFF_VM_CLOCK..]),
            vdi_size: le_u64(&buf[OFF_VDI_SIZE..]),
            vm_state_size: le_u64(&buf[OFF_VM_STATE_SIZE..]),
            copy_policy: buf[OFF_COPY_POLICY],
            store_policy: buf[OFF_STORE_POLICY],
            nr_copies: buf[OFF_NR_COPIES],
            block_size_shift: buf[OFF_BLOCK_SHIFT],
            snap_id: le_u32(&buf[OFF_SNAP_ID..]),
            vdi_id: le_u32(&buf[OFF_VDI_ID..]),
            parent_vdi_id: le_u32(&buf[OFF_PARENT..]),
            child_vdi_id,
            data_vdi_id: Vec::new(),
        })
    }

    /// Decode a complete inode object.
    pub fn decode(buf: &[u8]) -> SdResult<Self> {
        if buf.len() < SD_INODE_SIZE {
            return Err(SdError::InvalidParms);
        }
        let mut inode = Self::decode_header(buf)?;
        inode.data_vdi_id = buf[SD_INODE_HEADER_SIZE..SD_INODE_SIZE]
            .chunks_exact(4)
            .map(le_u32)
            .collect();
        Ok(inode)
    }
}

impl Default for SdInode {
    fn default() -> Self {
        Self::new()
    }
}

fn put_str(dst: &mut [u8], s: &str) {
    // keep the trailing NUL
    let n = s.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn get_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}
