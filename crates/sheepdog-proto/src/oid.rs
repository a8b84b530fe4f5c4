/// Object ID type and addressing functions.
///
/// Object ID layout (64 bits):
/// - Bits  0-19: data object index (20 bits)
/// - Bits 32-55: VDI id (24 bits)
/// - Bit  62:    VM state object
/// - Bit  63:    VDI (inode) object

use std::fmt;

use crate::constants::*;

const VDI_SPACE_SHIFT: u64 = 32;
const SD_VDI_MASK: u64 = 0x00FF_FFFF_0000_0000;
const VDI_BIT: u64 = 1u64 << 63;
const VMSTATE_BIT: u64 = 1u64 << 62;

/// A 64-bit object identifier in the sheepdog object store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The null object id, used when there is no COW base.
    pub const NONE: Self = Self(0);

    /// Get the raw u64 value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a VDI (inode) object.
    #[inline]
    pub const fn is_vdi_obj(self) -> bool {
        self.0 & VDI_BIT != 0
    }

    /// Check if this is a VM state object.
    #[inline]
    pub const fn is_vmstate_obj(self) -> bool {
        self.0 & VMSTATE_BIT != 0
    }

    /// Check if this is a data object (neither inode nor VM state).
    #[inline]
    pub const fn is_data_obj(self) -> bool {
        !self.is_vdi_obj() && !self.is_vmstate_obj()
    }

    /// Extract the VDI id from this object ID.
    #[inline]
    pub const fn to_vid(self) -> u32 {
        ((self.0 & SD_VDI_MASK) >> VDI_SPACE_SHIFT) as u32
    }

    /// Get the data object index from a data or VM state OID.
    #[inline]
    pub const fn data_index(self) -> u64 {
        self.0 & (MAX_DATA_OBJS - 1)
    }

    /// Create a VDI (inode) OID from a VDI id.
    #[inline]
    pub fn from_vid(vid: u32) -> Self {
        debug_assert!(vid < SD_NR_VDIS, "vdi id {vid:#x} out of range");
        Self(VDI_BIT | ((vid as u64) << VDI_SPACE_SHIFT))
    }

    /// Create a data OID from a VDI id and data index.
    #[inline]
    pub fn from_vid_data(vid: u32, idx: u64) -> Self {
        debug_assert!(vid < SD_NR_VDIS, "vdi id {vid:#x} out of range");
        debug_assert!(idx < MAX_DATA_OBJS, "data index {idx} out of range");
        Self(((vid as u64) << VDI_SPACE_SHIFT) | idx)
    }

    /// Create a VM state OID from a VDI id and index.
    #[inline]
    pub fn from_vid_vmstate(vid: u32, idx: u64) -> Self {
        debug_assert!(vid < SD_NR_VDIS, "vdi id {vid:#x} out of range");
        debug_assert!(idx < MAX_DATA_OBJS, "vmstate index {idx} out of range");
        Self(VMSTATE_BIT | ((vid as u64) << VDI_SPACE_SHIFT) | idx)
    }

    /// Same object slot, moved to another VDI.
    ///
    /// Data objects keep their index; anything else becomes the inode
    /// object of `vid`.
    pub fn retarget(self, vid: u32) -> Self {
        if self.is_data_obj() {
            Self::from_vid_data(vid, self.data_index())
        } else {
            Self::from_vid(vid)
        }
    }

    /// Count the number of objects of `1 << block_size_shift` bytes needed
    /// for the given VDI size.
    pub const fn count_data_objs(vdi_size: u64, block_size_shift: u8) -> u64 {
        let obj_size = 1u64 << block_size_shift;
        (vdi_size + obj_size - 1) / obj_size
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OID({:#018x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
