//! Administrative requests.
//!
//! Each call opens its own connection, sends one request, reads one
//! response and closes the connection. Nothing here is retried: transport
//! and daemon errors go straight back to the caller.

use std::sync::Arc;

use bitvec::prelude::*;
use sheepdog_core::transport::{exchange, Connector};
use sheepdog_proto::constants::{SD_MAX_VDI_LEN, SD_MAX_VDI_TAG_LEN, SD_NR_VDIS};
use sheepdog_proto::inode::{SdInode, SD_INODE_HEADER_SIZE, SD_INODE_SIZE};
use sheepdog_proto::request::{
    ClusterDefaults, ObjRequest, Opcode, SdResponse, VdiRequest, SD_FLAG_CMD_WRITE, SD_HEADER_SIZE,
};
use sheepdog_proto::{ObjectId, SdError};
use tracing::{debug, warn};

use crate::config::LockType;
use crate::error::{DriverError, DriverResult};

/// Parameters of a NEW_VDI request.
#[derive(Debug, Clone, Default)]
pub struct NewVdiParams {
    pub name: String,
    pub vdi_size: u64,
    pub base_vdi_id: u32,
    pub nr_copies: u8,
    pub copy_policy: u8,
    pub block_size_shift: u8,
    /// Turn the base VDI into a snapshot of `name`.
    pub snapshot: bool,
}

/// Issues one-shot requests on short-lived connections.
#[derive(Clone)]
pub struct AdminClient {
    connector: Arc<dyn Connector>,
}

impl AdminClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Send `header` + `payload` on a fresh connection and return the
    /// response with at most `rlen` payload bytes.
    pub async fn request(
        &self,
        header: &[u8; SD_HEADER_SIZE],
        payload: &[u8],
        rlen: usize,
    ) -> DriverResult<(SdResponse, Vec<u8>)> {
        let mut conn = self
            .connector
            .connect()
            .await
            .map_err(|_| DriverError::Transport(self.connector.name()))?;
        exchange(&mut conn, header, payload, rlen)
            .await
            .map_err(|_| DriverError::Transport(self.connector.name()))
    }

    /// Look up a VDI by name and snapshot id or tag, optionally locking it.
    pub async fn find_vdi(
        &self,
        name: &str,
        snap_id: u32,
        tag: &str,
        lock: Option<LockType>,
    ) -> DriverResult<u32> {
        let mut payload = name_buf(name, SD_MAX_VDI_LEN);
        payload.extend_from_slice(&name_buf(tag, SD_MAX_VDI_TAG_LEN));

        let mut req = match lock {
            Some(lock_type) => {
                let mut req = VdiRequest::new(Opcode::LockVdi);
                req.lock_type = lock_type.code();
                req
            }
            None => VdiRequest::new(Opcode::GetVdiInfo),
        };
        req.hdr.flags = SD_FLAG_CMD_WRITE;
        req.hdr.data_length = payload.len() as u32;
        req.snapid = snap_id;

        let (rsp, _) = self.request(&req.to_bytes(), &payload, 0).await?;
        match rsp.check() {
            Ok(()) => Ok(rsp.vdi_id()),
            Err(SdError::NoVdi) => Err(DriverError::NotFound(format!("{} {} {}", name, snap_id, tag))),
            Err(SdError::VdiLocked) => Err(DriverError::Busy(name.to_string())),
            Err(e) => Err(DriverError::server(
                format!("cannot get vdi info for {} {} {}", name, snap_id, tag),
                e,
            )),
        }
    }

    /// Create a VDI, returning its id.
    pub async fn new_vdi(&self, params: &NewVdiParams) -> DriverResult<u32> {
        let payload = name_buf(&params.name, SD_MAX_VDI_LEN);
        let mut req = VdiRequest::new(Opcode::NewVdi);
        req.hdr.flags = SD_FLAG_CMD_WRITE;
        req.hdr.data_length = payload.len() as u32;
        req.base_vdi_id = params.base_vdi_id;
        req.snapid = params.snapshot as u32;
        req.vdi_size = params.vdi_size;
        req.copies = params.nr_copies;
        req.copy_policy = params.copy_policy;
        req.block_size_shift = params.block_size_shift;

        let (rsp, _) = self.request(&req.to_bytes(), &payload, 0).await?;
        rsp.check()
            .map_err(|e| DriverError::server(format!("cannot create VDI {}", params.name), e))?;
        debug!("created vdi {:#x} ({}) from {:#x}", rsp.vdi_id(), params.name, params.base_vdi_id);
        Ok(rsp.vdi_id())
    }

    /// Delete a VDI or one of its snapshots.
    pub async fn delete_vdi(
        &self,
        name: &str,
        tag: &str,
        base_vdi_id: u32,
        snap_id: u32,
    ) -> DriverResult<()> {
        let mut payload = name_buf(name, SD_MAX_VDI_LEN);
        if !tag.is_empty() {
            payload.extend_from_slice(&name_buf(tag, SD_MAX_VDI_TAG_LEN));
        }
        let mut req = VdiRequest::new(Opcode::DelVdi);
        req.hdr.flags = SD_FLAG_CMD_WRITE;
        req.hdr.data_length = payload.len() as u32;
        req.base_vdi_id = base_vdi_id;
        req.snapid = snap_id;

        let (rsp, _) = self.request(&req.to_bytes(), &payload, 0).await?;
        rsp.check()
            .map_err(|e| DriverError::server(format!("cannot delete {}", name), e))
    }

    /// Drop the lock taken at open. A VDI that is not locked is fine.
    pub async fn release_vdi(&self, name: &str, vdi_id: u32) -> DriverResult<()> {
        let payload = name_buf(name, SD_MAX_VDI_LEN);
        let mut req = VdiRequest::new(Opcode::ReleaseVdi);
        req.hdr.flags = SD_FLAG_CMD_WRITE;
        req.hdr.data_length = payload.len() as u32;
        req.base_vdi_id = vdi_id;

        let (rsp, _) = self.request(&req.to_bytes(), &payload, 0).await?;
        match rsp.check() {
            Ok(()) => Ok(()),
            Err(SdError::VdiNotLocked) => {
                debug!("{} was not locked", name);
                Ok(())
            }
            Err(e) => Err(DriverError::server(format!("cannot release {}", name), e)),
        }
    }

    /// Read `len` bytes at `offset` of an object.
    pub async fn read_object(
        &self,
        oid: ObjectId,
        copies: u8,
        len: usize,
        offset: u64,
        cache_flags: u16,
    ) -> DriverResult<Vec<u8>> {
        let mut req = ObjRequest::new(Opcode::ReadObj, oid);
        req.hdr.flags = cache_flags;
        req.hdr.data_length = len as u32;
        req.copies = copies;
        req.offset = offset;

        let (rsp, mut data) = self.request(&req.to_bytes(), &[], len).await?;
        rsp.check()
            .map_err(|e| DriverError::server(format!("cannot read object {}", oid), e))?;
        data.resize(len, 0);
        Ok(data)
    }

    /// Write `data` at `offset` of an object, creating it first if asked.
    pub async fn write_object(
        &self,
        oid: ObjectId,
        copies: u8,
        copy_policy: u8,
        data: &[u8],
        offset: u64,
        create: bool,
        cache_flags: u16,
    ) -> DriverResult<()> {
        let opcode = if create { Opcode::CreateAndWriteObj } else { Opcode::WriteObj };
        let mut req = ObjRequest::new(opcode, oid);
        req.hdr.flags = SD_FLAG_CMD_WRITE | cache_flags;
        req.hdr.data_length = data.len() as u32;
        req.copies = copies;
        req.copy_policy = copy_policy;
        req.offset = offset;

        let (rsp, _) = self.request(&req.to_bytes(), data, 0).await?;
        rsp.check()
            .map_err(|e| DriverError::server(format!("cannot write object {}", oid), e))
    }

    /// Load the inode of `vid`, either complete or header only.
    pub async fn read_inode(
        &self,
        vid: u32,
        copies: u8,
        header_only: bool,
        cache_flags: u16,
    ) -> DriverResult<SdInode> {
        let len = if header_only { SD_INODE_HEADER_SIZE } else { SD_INODE_SIZE };
        let buf = self
            .read_object(ObjectId::from_vid(vid), copies, len, 0, cache_flags)
            .await?;
        let decoded = if header_only {
            SdInode::decode_header(&buf)
        } else {
            SdInode::decode(&buf)
        };
        decoded.map_err(|e| DriverError::server(format!("bad inode for vdi {:#x}", vid), e))
    }

    /// Persist the header of `inode` into its VDI object.
    pub async fn write_inode_header(&self, inode: &SdInode, cache_flags: u16) -> DriverResult<()> {
        self.write_object(
            ObjectId::from_vid(inode.vdi_id),
            inode.nr_copies,
            inode.copy_policy,
            &inode.encode_header(),
            0,
            false,
            cache_flags,
        )
        .await
    }

    /// Ask the cluster for its default redundancy and object size.
    pub async fn cluster_defaults(&self) -> DriverResult<ClusterDefaults> {
        let req = VdiRequest::new(Opcode::GetClusterDefault);
        let (rsp, _) = self.request(&req.to_bytes(), &[], 0).await?;
        rsp.check()
            .map_err(|e| DriverError::server("cannot get cluster defaults", e))?;
        Ok(rsp.cluster_defaults())
    }

    /// Fetch the bitmap of VDI ids in use.
    pub async fn read_vdi_bitmap(&self) -> DriverResult<BitVec<u8, Lsb0>> {
        let len = SD_NR_VDIS as usize / 8;
        let mut req = VdiRequest::new(Opcode::ReadVdis);
        req.hdr.data_length = len as u32;

        let (rsp, mut data) = self.request(&req.to_bytes(), &[], len).await?;
        rsp.check()
            .map_err(|e| DriverError::server("cannot read VDI bitmap", e))?;
        if data.len() < len {
            warn!("short VDI bitmap: {} of {} bytes", data.len(), len);
            data.resize(len, 0);
        }
        Ok(BitVec::from_vec(data))
    }
}

/// A NUL-padded fixed-size name field.
fn name_buf(s: &str, size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    let n = s.len().min(size - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    buf
}
