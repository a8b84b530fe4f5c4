/// Request and response headers of the sheepdog client protocol.
///
/// Every message starts with a fixed 48-byte little-endian header. The
/// first 16 bytes are shared (version, opcode, flags, epoch, id, payload
/// length); the rest is opcode specific. A payload of `data_length` bytes
/// follows a request only when `SD_FLAG_CMD_WRITE` is set, and follows a
/// response whenever `data_length` is non-zero.

use crate::constants::SD_PROTO_VER;
use crate::error::{SdError, SdResult};
use crate::oid::ObjectId;

/// Size of every request and response header.
pub const SD_HEADER_SIZE: usize = 48;

/// Request carries a payload
pub const SD_FLAG_CMD_WRITE: u16 = 0x01;
/// Create the object as a copy of `cow_oid`
pub const SD_FLAG_CMD_COW: u16 = 0x02;
/// Writeback mode for the daemon's object cache
pub const SD_FLAG_CMD_CACHE: u16 = 0x04;
/// Bypass the daemon's object cache
pub const SD_FLAG_CMD_DIRECT: u16 = 0x08;

/// Client protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    CreateAndWriteObj = 0x01,
    ReadObj = 0x02,
    WriteObj = 0x03,
    NewVdi = 0x11,
    LockVdi = 0x12,
    ReleaseVdi = 0x13,
    GetVdiInfo = 0x14,
    ReadVdis = 0x15,
    FlushVdi = 0x16,
    DelVdi = 0x17,
    GetClusterDefault = 0x18,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::CreateAndWriteObj,
            0x02 => Self::ReadObj,
            0x03 => Self::WriteObj,
            0x11 => Self::NewVdi,
            0x12 => Self::LockVdi,
            0x13 => Self::ReleaseVdi,
            0x14 => Self::GetVdiInfo,
            0x15 => Self::ReadVdis,
            0x16 => Self::FlushVdi,
            0x17 => Self::DelVdi,
            0x18 => Self::GetClusterDefault,
            _ => return None,
        })
    }
}

// ─── Common prefix ──────────────────────────────────────────────────────────

/// The 16-byte prefix shared by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
}

impl RequestHeader {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode: opcode as u8,
            flags: 0,
            epoch: 0,
            id: 0,
            data_length: 0,
        }
    }

    /// Whether a payload of `data_length` bytes follows this header.
    pub fn has_payload(&self) -> bool {
        self.flags & SD_FLAG_CMD_WRITE != 0
    }

    fn write_to(&self, buf: &mut [u8; SD_HEADER_SIZE]) {
        buf[0] = self.proto_ver;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_length.to_le_bytes());
    }

    /// Parse the common prefix of any request header.
    pub fn from_bytes(buf: &[u8; SD_HEADER_SIZE]) -> Self {
        Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            epoch: le_u32(&buf[4..]),
            id: le_u32(&buf[8..]),
            data_length: le_u32(&buf[12..]),
        }
    }
}

// ─── Object requests ────────────────────────────────────────────────────────

/// Read, write or create-and-write of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRequest {
    pub hdr: RequestHeader,
    pub oid: ObjectId,
    pub cow_oid: ObjectId,
    pub copies: u8,
    pub copy_policy: u8,
    pub offset: u64,
}

impl ObjRequest {
    pub fn new(opcode: Opcode, oid: ObjectId) -> Self {
        Self {
            hdr: RequestHeader::new(opcode),
            oid,
            cow_oid: ObjectId::NONE,
            copies: 0,
            copy_policy: 0,
            offset: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SD_HEADER_SIZE] {
        let mut buf = [0u8; SD_HEADER_SIZE];
        self.hdr.write_to(&mut buf);
        buf[16..24].copy_from_slice(&self.oid.raw().to_le_bytes());
        buf[24..32].copy_from_slice(&self.cow_oid.raw().to_le_bytes());
        buf[32] = self.copies;
        buf[33] = self.copy_policy;
        buf[40..48].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SD_HEADER_SIZE]) -> Self {
        Self {
            hdr: RequestHeader::from_bytes(buf),
            oid: ObjectId(le_u64(&buf[16..])),
            cow_oid: ObjectId(le_u64(&buf[24..])),
            copies: buf[32],
            copy_policy: buf[33],
            offset: le_u64(&buf[40..]),
        }
    }
}

// ─── VDI requests ───────────────────────────────────────────────────────────

/// VDI management request (new, lock, release, lookup, delete, list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdiRequest {
    pub hdr: RequestHeader,
    pub vdi_size: u64,
    pub base_vdi_id: u32,
    pub copies: u8,
    pub copy_policy: u8,
    pub store_policy: u8,
    pub block_size_shift: u8,
    pub snapid: u32,
    pub lock_type: u32,
}

impl VdiRequest {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            hdr: RequestHeader::new(opcode),
            vdi_size: 0,
            base_vdi_id: 0,
            copies: 0,
            copy_policy: 0,
            store_policy: 0,
            block_size_shift: 0,
            snapid: 0,
            lock_type: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SD_HEADER_SIZE] {
        let mut buf = [0u8; SD_HEADER_SIZE];
        self.hdr.write_to(&mut buf);
        buf[16..24].copy_from_slice(&self.vdi_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.base_vdi_id.to_le_bytes());
        buf[28] = self.copies;
        buf[29] = self.copy_policy;
        buf[30] = self.store_policy;
        buf[31] = self.block_size_shift;
        buf[32..36].copy_from_slice(&self.snapid.to_le_bytes());
        buf[36..40].copy_from_slice(&self.lock_type.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SD_HEADER_SIZE]) -> Self {
        Self {
            hdr: RequestHeader::from_bytes(buf),
            vdi_size: le_u64(&buf[16..]),
            base_vdi_id: le_u32(&buf[24..]),
            copies: buf[28],
            copy_policy: buf[29],
            store_policy: buf[30],
            block_size_shift: buf[31],
            snapid: le_u32(&buf[32..]),
            lock_type: le_u32(&buf[36..]),
        }
    }
}

// ─── Responses ──────────────────────────────────────────────────────────────

/// Cluster-wide defaults returned by `GetClusterDefault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterDefaults {
    pub nr_copies: u8,
    pub copy_policy: u8,
    pub block_size_shift: u8,
}

/// Response header. The opcode-specific trailer (bytes 20..48) is kept
/// raw and read through typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdResponse {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub result: u32,
    trailer: [u8; SD_HEADER_SIZE - 20],
}

impl SdResponse {
    /// Build a response to request `id`.
    pub fn new(opcode: Opcode, id: u32, result: SdResult<()>) -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode: opcode as u8,
            flags: 0,
            epoch: 0,
            id,
            data_length: 0,
            result: match result {
                Ok(()) => 0,
                Err(e) => e.to_code(),
            },
            trailer: [0u8; SD_HEADER_SIZE - 20],
        }
    }

    /// The result code as a `Result`.
    pub fn check(&self) -> SdResult<()> {
        SdError::check(self.result)
    }

    /// VDI id of a VDI response.
    pub fn vdi_id(&self) -> u32 {
        le_u32(&self.trailer[4..])
    }

    pub fn with_vdi_id(mut self, vid: u32) -> Self {
        self.trailer[4..8].copy_from_slice(&vid.to_le_bytes());
        self
    }

    /// Copy count of an object response.
    pub fn copies(&self) -> u8 {
        self.trailer[0]
    }

    /// Defaults carried by a cluster response.
    pub fn cluster_defaults(&self) -> ClusterDefaults {
        ClusterDefaults {
            nr_copies: self.trailer[0],
            copy_policy: self.trailer[1],
            block_size_shift: self.trailer[2],
        }
    }

    pub fn with_cluster_defaults(mut self, d: ClusterDefaults) -> Self {
        self.trailer[0] = d.nr_copies;
        self.trailer[1] = d.copy_policy;
        self.trailer[2] = d.block_size_shift;
        self
    }

    pub fn to_bytes(&self) -> [u8; SD_HEADER_SIZE] {
        let mut buf = [0u8; SD_HEADER_SIZE];
        buf[0] = self.proto_ver;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.result.to_le_bytes());
        buf[20..].copy_from_slice(&self.trailer);
        buf
    }

    pub fn from_bytes(buf: &[u8; SD_HEADER_SIZE]) -> Self {
        let mut trailer = [0u8; SD_HEADER_SIZE - 20];
        trailer.copy_from_slice(&buf[20..]);
        Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            epoch: le_u32(&buf[4..]),
            id: le_u32(&buf[8..]),
            data_length: le_u32(&buf[12..]),
            result: le_u32(&buf[16..]),
            trailer,
        }
    }
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}
