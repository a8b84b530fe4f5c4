//! The data-path session.
//!
//! One persistent connection carries every data request of an open
//! device. Requests are written whole by whichever task holds the link
//! lock, and a single receive task matches responses to in-flight
//! requests by id. Responses may arrive in any order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sheepdog_core::transport::{BoxedReader, BoxedWriter, Connection};
use sheepdog_proto::inode::SdInode;
use sheepdog_proto::request::{
    ObjRequest, Opcode, SdResponse, SD_FLAG_CMD_COW, SD_FLAG_CMD_WRITE, SD_HEADER_SIZE,
};
use sheepdog_proto::ObjectId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::admin::AdminClient;
use crate::aio::{SubKind, SubRequest};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::overlap::OverlapSerializer;

/// Cached VDI state shared by all operations of a session.
pub(crate) struct VdiState {
    pub inode: SdInode,
    /// The device was opened on a snapshot and has not branched yet.
    pub is_snapshot: bool,
    pub cache_flags: u16,
    pub discard_supported: bool,
}

/// Sub-requests owned by the session, keyed by request id.
#[derive(Default)]
pub(crate) struct RequestTable {
    next_id: u32,
    pub inflight: HashMap<u32, SubRequest>,
    /// Requests waiting to be replayed after a reconnect, in id order.
    pub failed: BTreeMap<u32, SubRequest>,
}

impl RequestTable {
    /// Next free request id. Ids wrap but never collide with a live one.
    pub fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.inflight.contains_key(&id) && !self.failed.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty() && self.failed.is_empty()
    }
}

/// Write side of the data connection.
pub(crate) struct Link {
    /// `None` while the connection is down.
    pub writer: Option<BoxedWriter>,
    /// Bumped on every reconnect.
    pub generation: u64,
}

pub struct Session {
    pub(crate) name: String,
    pub(crate) admin: AdminClient,
    pub(crate) vdi: RwLock<VdiState>,
    pub(crate) overlap: OverlapSerializer,
    pub(crate) table: Mutex<RequestTable>,
    pub(crate) link: tokio::sync::Mutex<Link>,
    pub(crate) recovery: tokio::sync::Mutex<()>,
    pub(crate) branch: tokio::sync::Mutex<()>,
    pub(crate) reconnect_delay: Duration,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    next_op: AtomicU64,
}

impl Session {
    /// Open the data connection and start receiving on it.
    pub(crate) async fn connect(
        admin: AdminClient,
        name: &str,
        config: &DriverConfig,
    ) -> DriverResult<Arc<Self>> {
        let conn = admin
            .connector()
            .connect()
            .await
            .map_err(|_| DriverError::Transport(admin.connector().name()))?;

        let session = Arc::new(Session {
            name: name.to_string(),
            admin,
            vdi: RwLock::new(VdiState {
                inode: SdInode::new(),
                is_snapshot: false,
                cache_flags: config.cache_mode.request_flags(),
                discard_supported: true,
            }),
            overlap: OverlapSerializer::new(),
            table: Mutex::new(RequestTable::default()),
            link: tokio::sync::Mutex::new(Link {
                writer: Some(conn.writer),
                generation: 0,
            }),
            recovery: tokio::sync::Mutex::new(()),
            branch: tokio::sync::Mutex::new(()),
            reconnect_delay: config.reconnect_delay,
            receiver: Mutex::new(None),
            closed: AtomicBool::new(false),
            next_op: AtomicU64::new(1),
        });
        session.start_receiver(conn.reader, 0);
        Ok(session)
    }

    pub(crate) fn start_receiver(self: &Arc<Self>, reader: BoxedReader, generation: u64) {
        let handle = tokio::spawn(receive_loop(Arc::downgrade(self), reader, generation));
        if let Some(old) = self.receiver.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop the current receive task and wait for it to exit.
    pub(crate) async fn stop_receiver(&self) {
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub(crate) fn next_op_id(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether any request is still owned by the session.
    pub(crate) fn has_outstanding(&self) -> bool {
        !self.table.lock().is_empty()
    }

    pub(crate) fn inode_snapshot(&self) -> SdInode {
        self.vdi.read().inode.clone()
    }

    /// Tear down the data connection for good.
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let writer = self.link.lock().await.writer.take();
        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
        }
        self.stop_receiver().await;
    }

    /// Replace the data connection with `conn`. Only valid while nothing
    /// is outstanding.
    pub(crate) async fn swap_link(self: &Arc<Self>, conn: Connection) {
        let mut link = self.link.lock().await;
        if let Some(mut old) = link.writer.take() {
            let _ = old.shutdown().await;
        }
        self.stop_receiver().await;
        link.generation += 1;
        link.writer = Some(conn.writer);
        self.start_receiver(conn.reader, link.generation);
    }

    pub(crate) fn lookup(&self, id: u32) -> Option<SubRequest> {
        self.table.lock().inflight.get(&id).cloned()
    }

    /// Remove a finished request and drop its reference on the operation.
    /// A request already taken by a cancel is left alone.
    pub(crate) fn retire(&self, id: u32) {
        let sub = self.table.lock().inflight.remove(&id);
        if let Some(sub) = sub {
            sub.op.put(true);
        }
    }

    /// Register `subs` and write them to the connection in order.
    ///
    /// Every request enters the in-flight table while the link lock is
    /// held, so recovery never sees a request that is still being sent.
    /// Registration stops once the operation is canceled.
    pub(crate) async fn dispatch(self: &Arc<Self>, subs: Vec<SubRequest>) {
        let mut link = self.link.lock().await;
        for mut sub in subs {
            let id = {
                let mut table = self.table.lock();
                if sub.op.is_canceled() {
                    return;
                }
                let id = table.alloc_id();
                sub.id = id;
                sub.op.add_pending();
                table.inflight.insert(id, sub);
                id
            };
            self.write_locked(&mut link, id).await;
        }
    }

    /// Put a request back in flight under its existing id and write it.
    pub(crate) async fn requeue(self: &Arc<Self>, sub: SubRequest) {
        let id = sub.id;
        let mut link = self.link.lock().await;
        self.table.lock().inflight.insert(id, sub);
        self.write_locked(&mut link, id).await;
    }

    /// Write in-flight request `id`.
    ///
    /// If the connection is down the request stays in flight and is
    /// replayed by recovery. A write failure starts recovery.
    async fn write_locked(self: &Arc<Self>, link: &mut Link, id: u32) {
        let Some(sub) = self.lookup(id) else {
            return;
        };
        let generation = link.generation;
        let Some(writer) = link.writer.as_mut() else {
            debug!("link down, request {} waits for replay", id);
            return;
        };

        let frame = self.encode_frame(id, &sub);
        debug!(
            "send {} {:?} oid {} off {} len {}",
            id, sub.kind, sub.oid, sub.offset, sub.len
        );
        let res = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            warn!("failed to send request {}: {}", id, e);
            link.writer = None;
            self.spawn_recovery(generation);
        }
    }

    /// Header plus payload of a sub-request, built from the current inode.
    fn encode_frame(&self, id: u32, sub: &SubRequest) -> Vec<u8> {
        let vdi = self.vdi.read();
        let inode = &vdi.inode;

        let (opcode, oid, offset, payload): (Opcode, ObjectId, u64, Vec<u8>) = match sub.kind {
            SubKind::Read => (Opcode::ReadObj, sub.oid, sub.offset, Vec::new()),
            SubKind::Write => {
                let opcode = if sub.create { Opcode::CreateAndWriteObj } else { Opcode::WriteObj };
                let buf = sub.op.buf.lock();
                let start = sub.buf_offset;
                let data = buf[start..start + sub.len as usize].to_vec();
                (opcode, sub.oid, sub.offset, data)
            }
            SubKind::Discard => (
                Opcode::WriteObj,
                ObjectId::from_vid(inode.vdi_id),
                SdInode::owner_entry_offset(sub.oid.data_index()),
                vec![0u8; 4],
            ),
            SubKind::Metadata => {
                let min = (sub.offset - SdInode::owner_entry_offset(0)) / 4;
                let max = min + sub.len as u64 / 4 - 1;
                (Opcode::WriteObj, sub.oid, sub.offset, inode.encode_owner_range(min, max))
            }
            SubKind::Flush => (Opcode::FlushVdi, ObjectId::from_vid(inode.vdi_id), 0, Vec::new()),
        };

        let mut req = ObjRequest::new(opcode, oid);
        req.hdr.id = id;
        req.hdr.flags = vdi.cache_flags;
        req.copies = inode.nr_copies;
        req.copy_policy = inode.copy_policy;
        req.offset = offset;
        if sub.kind == SubKind::Read {
            req.hdr.data_length = sub.len;
        } else if !payload.is_empty() {
            req.hdr.flags |= SD_FLAG_CMD_WRITE;
            req.hdr.data_length = payload.len() as u32;
        }
        if !sub.base_oid.is_none() {
            req.hdr.flags |= SD_FLAG_CMD_COW;
            req.cow_oid = sub.base_oid;
        }

        let mut frame = Vec::with_capacity(SD_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&req.to_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.get_mut().take() {
            handle.abort();
        }
    }
}

/// Read responses until the connection fails, then hand over to recovery.
async fn receive_loop(session: Weak<Session>, mut reader: BoxedReader, generation: u64) {
    loop {
        let mut hdr = [0u8; SD_HEADER_SIZE];
        let res = reader.read_exact(&mut hdr).await;

        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = res {
            if !session.is_closed() {
                warn!("connection to {} lost: {}", session.admin.connector().name(), e);
                session.spawn_recovery(generation);
            }
            return;
        }

        let rsp = SdResponse::from_bytes(&hdr);
        if let Err(e) = session.handle_response(&rsp, &mut reader).await {
            if !session.is_closed() {
                error!("bad response {} on {}: {}", rsp.id, session.name, e);
                session.spawn_recovery(generation);
            }
            return;
        }
    }
}
