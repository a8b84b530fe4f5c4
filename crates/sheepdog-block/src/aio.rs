//! Aggregate operations and their per-object sub-requests.
//!
//! A read, write or discard covering N objects becomes N sub-requests on
//! the data connection. The operation completes when its last
//! sub-request is answered; a write that allocated objects then persists
//! the touched owner table entries with one more request.

use std::sync::Arc;

use parking_lot::Mutex;
use sheepdog_core::transport::BoxedReader;
use sheepdog_proto::inode::SdInode;
use sheepdog_proto::request::{SdResponse, SD_FLAG_CMD_CACHE, SD_FLAG_CMD_DIRECT};
use sheepdog_proto::{ObjectId, SdError, SdResult};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::{DriverError, DriverResult};
use crate::session::{Session, VdiState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    Discard,
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubKind {
    Read,
    Write,
    /// Clear one owner table entry.
    Discard,
    /// Persist a range of owner table entries.
    Metadata,
    Flush,
}

struct OpState {
    /// Outstanding sub-requests, plus one while the operation is still
    /// submitting.
    nr_pending: usize,
    error: Option<DriverError>,
    cancelable: bool,
    canceled: bool,
    /// Sub-requests being redirected after a READONLY answer. They are in
    /// neither request table meanwhile.
    following: usize,
    dirty: Option<(u64, u64)>,
}

/// One caller-visible I/O operation.
pub struct AioOp {
    pub(crate) id: u64,
    pub(crate) kind: OpKind,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) min_idx: u64,
    pub(crate) max_idx: u64,
    pub(crate) buf: Mutex<Vec<u8>>,
    state: Mutex<OpState>,
    idle: Notify,
}

impl AioOp {
    pub(crate) fn new(
        id: u64,
        kind: OpKind,
        offset: u64,
        len: u64,
        object_size: u64,
        buf: Vec<u8>,
    ) -> Self {
        Self {
            id,
            kind,
            offset,
            len,
            min_idx: offset / object_size,
            max_idx: (offset + len) / object_size,
            buf: Mutex::new(buf),
            state: Mutex::new(OpState {
                nr_pending: 1,
                error: None,
                cancelable: true,
                canceled: false,
                following: 0,
                dirty: None,
            }),
            idle: Notify::new(),
        }
    }

    pub(crate) fn add_pending(&self) {
        self.state.lock().nr_pending += 1;
    }

    /// Drop one pending reference. A retired sub-request also makes the
    /// operation no longer cancelable.
    pub(crate) fn put(&self, retired: bool) {
        let idle = {
            let mut st = self.state.lock();
            st.nr_pending -= 1;
            if retired {
                st.cancelable = false;
            }
            st.nr_pending == 0
        };
        if idle {
            self.idle.notify_one();
        }
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.state.lock().nr_pending == 0;
            if idle {
                return;
            }
            self.idle.notified().await;
        }
    }

    pub(crate) fn fail(&self, err: DriverError) {
        self.state.lock().error.get_or_insert(err);
    }

    fn widen_dirty(&self, idx: u64) {
        let mut st = self.state.lock();
        st.dirty = Some(match st.dirty {
            Some((min, max)) => (min.min(idx), max.max(idx)),
            None => (idx, idx),
        });
    }

    fn take_dirty(&self) -> Option<(u64, u64)> {
        self.state.lock().dirty.take()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    pub(crate) fn is_cancelable(&self) -> bool {
        let st = self.state.lock();
        st.cancelable && !st.canceled && st.following == 0 && st.nr_pending > 0
    }

    pub(crate) fn begin_follow(&self) {
        self.state.lock().following += 1;
    }

    pub(crate) fn end_follow(&self) {
        self.state.lock().following -= 1;
    }

    /// Mark the operation canceled after `removed` of its sub-requests
    /// were dropped from the replay queue.
    pub(crate) fn cancel(&self, removed: usize) {
        let idle = {
            let mut st = self.state.lock();
            st.canceled = true;
            st.error = Some(DriverError::Canceled);
            st.nr_pending -= removed;
            st.nr_pending == 0
        };
        if idle {
            self.idle.notify_one();
        }
    }

    pub(crate) fn result(&self) -> DriverResult<()> {
        match self.state.lock().error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn take_buf(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock())
    }

    /// Split the operation into per-object sub-requests against the
    /// current owner table.
    fn build_subs(self: &Arc<Self>, vdi: &VdiState) -> Vec<SubRequest> {
        let inode = &vdi.inode;
        let mut subs = Vec::new();

        match self.kind {
            OpKind::Flush => {
                if vdi.cache_flags == SD_FLAG_CMD_CACHE {
                    let oid = ObjectId::from_vid(inode.vdi_id);
                    subs.push(SubRequest::new(self, SubKind::Flush, oid, 0, 0, 0));
                }
                return subs;
            }
            OpKind::Discard if !vdi.discard_supported => return subs,
            _ => {}
        }

        let obj_size = inode.object_size();
        let mut done = 0u64;
        while done < self.len {
            let pos = self.offset + done;
            let idx = pos / obj_size;
            let obj_off = pos % obj_size;
            let len = (obj_size - obj_off).min(self.len - done);
            let owner = inode.get_vid(idx);
            let buf_offset = done as usize;

            match self.kind {
                // Unallocated objects read as zeros, already in the buffer.
                OpKind::Read if owner != 0 => {
                    let oid = ObjectId::from_vid_data(owner, idx);
                    subs.push(SubRequest::new(self, SubKind::Read, oid, obj_off, len, buf_offset));
                }
                OpKind::Write => {
                    let oid = ObjectId::from_vid_data(inode.vdi_id, idx);
                    let mut sub = SubRequest::new(self, SubKind::Write, oid, obj_off, len, buf_offset);
                    if owner == 0 {
                        sub.create = true;
                    } else if owner != inode.vdi_id {
                        sub.create = true;
                        sub.base_oid = ObjectId::from_vid_data(owner, idx);
                    }
                    subs.push(sub);
                }
                OpKind::Discard if len == obj_size && owner != 0 => {
                    let oid = ObjectId::from_vid_data(inode.vdi_id, idx);
                    subs.push(SubRequest::new(self, SubKind::Discard, oid, 0, 0, 0));
                }
                _ => {}
            }
            done += len;
        }
        subs
    }
}

/// A request for a single object, owned by the session's request table.
#[derive(Clone)]
pub(crate) struct SubRequest {
    pub id: u32,
    pub op: Arc<AioOp>,
    pub kind: SubKind,
    pub oid: ObjectId,
    /// Object to copy from when creating `oid`.
    pub base_oid: ObjectId,
    pub offset: u64,
    pub len: u32,
    pub create: bool,
    /// Where this request's bytes live in the operation buffer.
    pub buf_offset: usize,
}

impl SubRequest {
    fn new(
        op: &Arc<AioOp>,
        kind: SubKind,
        oid: ObjectId,
        offset: u64,
        len: u64,
        buf_offset: usize,
    ) -> Self {
        Self {
            id: 0,
            op: Arc::clone(op),
            kind,
            oid,
            base_oid: ObjectId::NONE,
            offset,
            len: len as u32,
            create: false,
            buf_offset,
        }
    }

    /// Owner table entries `min..=max` of `vdi_id`.
    fn metadata(op: &Arc<AioOp>, vdi_id: u32, min: u64, max: u64) -> Self {
        Self::new(
            op,
            SubKind::Metadata,
            ObjectId::from_vid(vdi_id),
            SdInode::owner_entry_offset(min),
            (max - min + 1) * 4,
            0,
        )
    }
}

impl Session {
    /// Run `op` to completion.
    pub(crate) async fn execute(self: &Arc<Self>, op: Arc<AioOp>) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        let _overlap = match op.kind {
            OpKind::Flush => None,
            _ => Some(self.overlap.acquire(op.id, op.min_idx, op.max_idx).await),
        };
        if op.is_canceled() {
            return Err(DriverError::Canceled);
        }

        if matches!(op.kind, OpKind::Write | OpKind::Discard) {
            self.ensure_writable().await?;
        }

        let subs = {
            let vdi = self.vdi.read();
            op.build_subs(&vdi)
        };
        debug!("op {} {:?} at {} len {}: {} requests", op.id, op.kind, op.offset, op.len, subs.len());
        self.dispatch(subs).await;
        op.put(false);
        op.wait_idle().await;

        if op.kind == OpKind::Write && !op.is_canceled() {
            if let Some((min, max)) = op.take_dirty() {
                let sub = {
                    let vdi = self.vdi.read();
                    SubRequest::metadata(&op, vdi.inode.vdi_id, min, max)
                };
                self.dispatch(vec![sub]).await;
                op.wait_idle().await;
            }
        }
        op.result()
    }

    /// Branch off the snapshot this device was opened on, once.
    async fn ensure_writable(self: &Arc<Self>) -> DriverResult<()> {
        let is_snapshot = self.vdi.read().is_snapshot;
        if !is_snapshot {
            return Ok(());
        }
        let _branch = self.branch.lock().await;
        let is_snapshot = self.vdi.read().is_snapshot;
        if is_snapshot {
            if let Err(e) = self.create_branch().await {
                error!("cannot branch {}: {}", self.name, e);
                return Err(DriverError::Io);
            }
        }
        Ok(())
    }

    /// Consume one response from the data connection.
    ///
    /// An error here means the stream can no longer be trusted.
    pub(crate) async fn handle_response(
        self: &Arc<Self>,
        rsp: &SdResponse,
        reader: &mut BoxedReader,
    ) -> SdResult<()> {
        let Some(sub) = self.lookup(rsp.id) else {
            error!("no request with id {}", rsp.id);
            return Err(SdError::InvalidParms);
        };

        let rlen = rsp.data_length as usize;
        let expected = match sub.kind {
            SubKind::Read => sub.len as usize,
            _ => 0,
        };
        if rlen > expected {
            error!("response {} carries {} bytes, asked for {}", rsp.id, rlen, expected);
            return Err(SdError::InvalidParms);
        }
        let mut data = vec![0u8; rlen];
        reader.read_exact(&mut data).await?;

        match (rsp.check(), sub.kind) {
            (Err(SdError::ReadOnly), _) => {
                let taken = {
                    let mut table = self.table.lock();
                    let taken = table.inflight.remove(&rsp.id);
                    if let Some(sub) = &taken {
                        sub.op.begin_follow();
                    }
                    taken
                };
                if let Some(sub) = taken {
                    debug!("{} is read-only, following the working VDI", sub.oid);
                    let session = Arc::clone(self);
                    tokio::spawn(async move { session.follow_readonly(sub).await });
                }
                return Ok(());
            }
            (Err(SdError::InvalidParms), SubKind::Flush) => {
                warn!("daemon has no object cache, disabling flush");
                self.vdi.write().cache_flags = SD_FLAG_CMD_DIRECT;
            }
            (Err(SdError::InvalidParms), SubKind::Discard) => {
                warn!("discard is not supported by the daemon");
                self.vdi.write().discard_supported = false;
            }
            (Err(e), kind) => {
                error!("{:?} request {} on {} failed: {}", kind, rsp.id, sub.oid, e);
                sub.op.fail(DriverError::Io);
            }
            (Ok(()), SubKind::Read) => {
                let n = data.len().min(sub.len as usize);
                let mut buf = sub.op.buf.lock();
                buf[sub.buf_offset..sub.buf_offset + n].copy_from_slice(&data[..n]);
            }
            (Ok(()), SubKind::Write) if sub.create && sub.oid.is_data_obj() => {
                let idx = sub.oid.data_index();
                self.vdi.write().inode.set_vid(idx, sub.oid.to_vid());
                sub.op.widen_dirty(idx);
            }
            (Ok(()), SubKind::Discard) => {
                self.vdi.write().inode.set_vid(sub.oid.data_index(), 0);
            }
            (Ok(()), _) => {}
        }
        self.retire(rsp.id);
        Ok(())
    }
}
