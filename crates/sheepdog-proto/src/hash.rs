/// FNV-1a hashing for VDI id placement.
///
/// The daemon places a VDI at `fnv1a(name)` in the VDI id space and probes
/// forward on collision, so clients searching for a name start there too.

use crate::constants::SD_NR_VDIS;

/// FNV-1a 64-bit initial basis.
pub const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a VDI name to its starting bucket in a VDI id space of
/// `space` ids.
#[inline]
pub fn vdi_hash_bucket(name: &str, space: usize) -> usize {
    let hval = fnv_64a_buf(name.as_bytes(), FNV1A_64_INIT);
    (hval % space as u64) as usize
}

/// Hash a VDI name to the 24-bit VDI id space.
#[inline]
pub fn sd_hash_vdi(name: &str) -> u32 {
    vdi_hash_bucket(name, SD_NR_VDIS as usize) as u32
}
