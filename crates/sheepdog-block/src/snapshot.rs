//! Snapshots, branches and VM state.

use bitvec::prelude::*;
use serde::Serialize;
use sheepdog_proto::defaults::DEFAULT_MAX_RESPONSE_SIZE;
use sheepdog_proto::hash::vdi_hash_bucket;
use sheepdog_proto::{ObjectId, SdError, SdInode};
use tracing::{debug, info, warn};

use crate::admin::NewVdiParams;
use crate::error::{DriverError, DriverResult};
use crate::location::parse_snapshot_ref;
use crate::session::Session;

/// One snapshot of the open VDI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub vdi_id: u32,
    pub id: u32,
    pub tag: String,
    pub date_sec: u32,
    pub date_nsec: u32,
    pub vm_state_size: u64,
    pub vm_clock_nsec: u64,
}

impl From<&SdInode> for SnapshotInfo {
    fn from(inode: &SdInode) -> Self {
        Self {
            vdi_id: inode.vdi_id,
            id: inode.snap_id,
            tag: inode.tag.clone(),
            date_sec: (inode.snap_ctime >> 32) as u32,
            date_nsec: inode.snap_ctime as u32,
            vm_state_size: inode.vm_state_size,
            vm_clock_nsec: inode.vm_clock_nsec,
        }
    }
}

/// VDI ids in use, in probe order for `name`: from its hash bucket to the
/// end of the id space, then from 0 up to the bucket.
pub(crate) fn probe_order(bitmap: &BitSlice<u8, Lsb0>, name: &str) -> Vec<u32> {
    if bitmap.is_empty() {
        return Vec::new();
    }
    let start = vdi_hash_bucket(name, bitmap.len());
    bitmap[start..]
        .iter_ones()
        .map(|i| (i + start) as u32)
        .chain(bitmap[..start].iter_ones().map(|i| i as u32))
        .collect()
}

impl Session {
    fn copies_and_flags(&self) -> (u8, u16) {
        let vdi = self.vdi.read();
        (vdi.inode.nr_copies, vdi.cache_flags)
    }

    /// NEW_VDI parameters for a child of the current inode.
    fn child_params(&self, snapshot: bool) -> NewVdiParams {
        let vdi = self.vdi.read();
        let inode = &vdi.inode;
        NewVdiParams {
            name: inode.name.clone(),
            vdi_size: inode.vdi_size,
            base_vdi_id: inode.vdi_id,
            nr_copies: inode.nr_copies,
            copy_policy: inode.copy_policy,
            block_size_shift: inode.block_size_shift,
            snapshot,
        }
    }

    /// Look up `snap_id`/`tag` of this VDI by name and adopt its header.
    /// The owner table is kept.
    pub(crate) async fn reload_inode(&self, snap_id: u32, tag: &str) -> DriverResult<()> {
        let (copies, flags) = self.copies_and_flags();
        let vid = self.admin.find_vdi(&self.name, snap_id, tag, None).await?;
        let header = self.admin.read_inode(vid, copies, true, flags).await?;

        let mut vdi = self.vdi.write();
        if vdi.inode.vdi_id != header.vdi_id {
            info!("{}: vdi {:#x} -> {:#x}", self.name, vdi.inode.vdi_id, header.vdi_id);
            vdi.inode.apply_header(&header);
        }
        Ok(())
    }

    /// Replace the snapshot this session is on with a new writable VDI
    /// based on it.
    ///
    /// The stale working VDI of the name is deleted first. If that fails,
    /// the new VDI is created as a snapshot instead, which keeps the old
    /// working VDI as an extra snapshot.
    pub(crate) async fn create_branch(&self) -> DriverResult<()> {
        let (copies, flags) = self.copies_and_flags();
        let mut params = self.child_params(false);
        info!("{:#x} is a snapshot, branching {}", params.base_vdi_id, params.name);

        let deleted = match self.admin.delete_vdi(&params.name, "", params.base_vdi_id, 0).await {
            Ok(()) => true,
            Err(DriverError::Server {
                source: SdError::NoVdi,
                ..
            }) => {
                debug!("{} has no working VDI", params.name);
                true
            }
            Err(e) => {
                warn!("cannot delete the working VDI of {}: {}", params.name, e);
                false
            }
        };
        params.snapshot = !deleted;

        let vid = self.admin.new_vdi(&params).await?;
        let inode = self.admin.read_inode(vid, copies, false, flags).await?;

        let mut vdi = self.vdi.write();
        vdi.inode = inode;
        vdi.is_snapshot = false;
        info!("{} branched as {:#x}", params.name, vid);
        Ok(())
    }

    /// Freeze the current VDI as a snapshot tagged `tag` and continue on a
    /// new writable VDI.
    pub(crate) async fn snapshot_create(
        &self,
        tag: &str,
        vm_state_size: u64,
        vm_clock_nsec: u64,
    ) -> DriverResult<()> {
        let (header, flags) = {
            let mut vdi = self.vdi.write();
            if vdi.is_snapshot {
                return Err(DriverError::InvalidArgument(
                    "cannot snapshot a snapshot".to_string(),
                ));
            }
            vdi.inode.tag = tag.to_string();
            vdi.inode.vm_state_size = vm_state_size;
            vdi.inode.vm_clock_nsec = vm_clock_nsec;
            (vdi.inode.header_clone(), vdi.cache_flags)
        };

        self.admin.write_inode_header(&header, flags).await?;
        let vid = self.admin.new_vdi(&self.child_params(true)).await?;
        let current = self.admin.read_inode(vid, header.nr_copies, true, flags).await?;

        self.vdi.write().inode.apply_header(&current);
        info!("snapshot '{}' of {} taken, now on {:#x}", tag, self.name, vid);
        Ok(())
    }

    /// Switch to snapshot `snapshot` (id or tag) and branch from it.
    /// The session is left unchanged on failure.
    pub(crate) async fn snapshot_goto(&self, snapshot: &str) -> DriverResult<()> {
        let _branch = self.branch.lock().await;
        let (snap_id, tag) = parse_snapshot_ref(snapshot);

        let (saved_inode, saved_snapshot) = {
            let vdi = self.vdi.read();
            (vdi.inode.clone(), vdi.is_snapshot)
        };

        let res = match self.reload_inode(snap_id, &tag).await {
            Ok(()) => self.create_branch().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &res {
            warn!("cannot go to snapshot {} of {}: {}", snapshot, self.name, e);
            let mut vdi = self.vdi.write();
            vdi.inode = saved_inode;
            vdi.is_snapshot = saved_snapshot;
        }
        res
    }

    /// Delete snapshot `snapshot` (id or tag) of this VDI.
    pub(crate) async fn snapshot_delete(&self, snapshot: &str) -> DriverResult<()> {
        let (snap_id, tag) = parse_snapshot_ref(snapshot);
        match self.admin.delete_vdi(&self.name, &tag, 0, snap_id).await {
            Err(DriverError::Server {
                source: SdError::NoVdi,
                ..
            }) => Err(DriverError::NotFound(format!("{} {}", self.name, snapshot))),
            res => res,
        }
    }

    /// Snapshots of this VDI, at most `max` of them.
    pub(crate) async fn snapshot_list(&self, max: usize) -> DriverResult<Vec<SnapshotInfo>> {
        let (copies, flags) = self.copies_and_flags();
        let bitmap = self.admin.read_vdi_bitmap().await?;

        let mut found = Vec::new();
        for vid in probe_order(&bitmap, &self.name) {
            if found.len() >= max {
                break;
            }
            let inode = match self.admin.read_inode(vid, copies, true, flags).await {
                Ok(inode) => inode,
                Err(e) => {
                    debug!("skipping vdi {:#x}: {}", vid, e);
                    continue;
                }
            };
            if inode.name == self.name && inode.is_snapshot() {
                found.push(SnapshotInfo::from(&inode));
            }
        }
        Ok(found)
    }

    /// Write VM state at `pos`, creating each object on its first write.
    pub(crate) async fn save_vmstate(&self, data: &[u8], pos: u64) -> DriverResult<usize> {
        let (vid, copies, copy_policy, obj_size, flags) = {
            let vdi = self.vdi.read();
            let inode = &vdi.inode;
            (inode.vdi_id, inode.nr_copies, inode.copy_policy, inode.object_size(), vdi.cache_flags)
        };

        let mut done = 0usize;
        while done < data.len() {
            let at = pos + done as u64;
            let offset = at % obj_size;
            let len = ((obj_size - offset) as usize).min(data.len() - done);
            let oid = ObjectId::from_vid_vmstate(vid, at / obj_size);
            self.admin
                .write_object(oid, copies, copy_policy, &data[done..done + len], offset, offset == 0, flags)
                .await?;
            done += len;
        }
        Ok(done)
    }

    /// Read `len` bytes of VM state at `pos` from the parent VDI, which
    /// holds the state saved before the last snapshot.
    pub(crate) async fn load_vmstate(&self, pos: u64, len: usize) -> DriverResult<Vec<u8>> {
        let (vid, copies, obj_size, flags) = {
            let vdi = self.vdi.read();
            let inode = &vdi.inode;
            (inode.parent_vdi_id, inode.nr_copies, inode.object_size(), vdi.cache_flags)
        };

        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let at = pos + out.len() as u64;
            let offset = at % obj_size;
            let n = ((obj_size - offset) as usize)
                .min(len - out.len())
                .min(DEFAULT_MAX_RESPONSE_SIZE);
            let oid = ObjectId::from_vid_vmstate(vid, at / obj_size);
            let chunk = self.admin.read_object(oid, copies, n, offset, flags).await?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
