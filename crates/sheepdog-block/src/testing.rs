//! An in-memory sheep daemon for tests.
//!
//! Each connection gets its own server task on a `tokio::io::duplex`
//! pipe. The daemon keeps objects in a map, implements the VDI calls the
//! driver uses, and lets tests log requests, inject write errors, hold
//! data responses and break every connection.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sheepdog_core::transport::{Connection, Connector};
use sheepdog_proto::constants::{
    LOCK_TYPE_NORMAL, SD_DEFAULT_BLOCK_SIZE_SHIFT, SD_DEFAULT_COPIES, SD_MAX_VDI_LEN,
    SD_NR_VDIS, SD_PROTO_VER,
};
use sheepdog_proto::hash::sd_hash_vdi;
use sheepdog_proto::inode::SD_INODE_HEADER_SIZE;
use sheepdog_proto::request::{
    ClusterDefaults, ObjRequest, Opcode, RequestHeader, SdResponse, VdiRequest, SD_FLAG_CMD_COW,
    SD_HEADER_SIZE,
};
use sheepdog_proto::{ObjectId, SdError, SdInode, SdResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

type ServerWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

/// An object request as seen by the daemon.
#[derive(Debug, Clone)]
pub(crate) struct LoggedRequest {
    pub conn: usize,
    pub id: u32,
    pub opcode: Opcode,
    pub flags: u16,
    pub oid: ObjectId,
    pub cow_oid: ObjectId,
    pub offset: u64,
    pub len: u32,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectId, Vec<u8>>,
    live: BTreeSet<u32>,
    locked: HashSet<u32>,
    log: Vec<LoggedRequest>,
    write_errors: VecDeque<SdError>,
    hold: bool,
    held: Vec<(usize, Vec<u8>)>,
    flush_unsupported: bool,
    discard_unsupported: bool,
    malformed: usize,
    clock: u64,
}

struct Inner {
    state: Mutex<State>,
    conns: Mutex<HashMap<usize, (ServerWriter, JoinHandle<()>)>>,
    next_conn: AtomicUsize,
    refuse: AtomicBool,
    connect_delay: Mutex<Duration>,
}

#[derive(Clone)]
pub(crate) struct FakeCluster {
    inner: Arc<Inner>,
}

struct FakeConnector {
    inner: Arc<Inner>,
}

fn cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl State {
    fn header(&self, vid: u32) -> Option<SdInode> {
        let obj = self.objects.get(&ObjectId::from_vid(vid))?;
        SdInode::decode_header(&obj[..SD_INODE_HEADER_SIZE]).ok()
    }

    fn inode(&self, vid: u32) -> Option<SdInode> {
        SdInode::decode(self.objects.get(&ObjectId::from_vid(vid))?).ok()
    }

    fn is_snapshot(&self, vid: u32) -> bool {
        self.header(vid).map(|h| h.is_snapshot()).unwrap_or(false)
    }

    /// The newest writable VDI called `name`.
    fn working_vdi(&self, name: &str) -> Option<u32> {
        self.live
            .iter()
            .filter_map(|&vid| self.header(vid).map(|h| (vid, h)))
            .filter(|(_, h)| h.name == name && !h.is_snapshot())
            .max_by_key(|(_, h)| h.create_time)
            .map(|(vid, _)| vid)
    }

    fn snapshot_vdi(&self, name: &str, snap_id: u32, tag: &str) -> Option<u32> {
        self.live.iter().copied().find(|&vid| {
            self.header(vid).is_some_and(|h| {
                h.name == name
                    && h.is_snapshot()
                    && if snap_id != 0 { h.snap_id == snap_id } else { h.tag == tag }
            })
        })
    }

    fn lookup(&self, name: &str, snap_id: u32, tag: &str) -> SdResult<u32> {
        let vid = if snap_id == 0 && tag.is_empty() {
            self.working_vdi(name)
        } else {
            self.snapshot_vdi(name, snap_id, tag)
        };
        vid.ok_or(SdError::NoVdi)
    }

    fn alloc_vid(&self, name: &str) -> u32 {
        let mut vid = sd_hash_vdi(name);
        while vid == 0 || self.objects.contains_key(&ObjectId::from_vid(vid)) {
            vid = (vid + 1) % SD_NR_VDIS;
        }
        vid
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock << 32
    }

    fn new_vdi(&mut self, name: &str, req: &VdiRequest) -> SdResult<u32> {
        let base = match req.base_vdi_id {
            0 => None,
            vid => Some(self.inode(vid).ok_or(SdError::NoVdi)?),
        };
        if base.is_none() && self.working_vdi(name).is_some() {
            return Err(SdError::VdiExist);
        }

        let vid = self.alloc_vid(name);
        let mut inode = match &base {
            Some(b) => SdInode {
                data_vdi_id: b.data_vdi_id.clone(),
                ..b.header_clone()
            },
            None => {
                let mut inode = SdInode::new();
                inode.nr_copies = if req.copies != 0 { req.copies } else { SD_DEFAULT_COPIES };
                inode.copy_policy = req.copy_policy;
                inode.block_size_shift = if req.block_size_shift != 0 {
                    req.block_size_shift
                } else {
                    SD_DEFAULT_BLOCK_SIZE_SHIFT
                };
                inode
            }
        };
        inode.name = name.to_string();
        inode.tag = String::new();
        inode.snap_ctime = 0;
        inode.vm_state_size = 0;
        inode.vm_clock_nsec = 0;
        inode.create_time = self.tick();
        inode.vdi_id = vid;
        inode.parent_vdi_id = req.base_vdi_id;
        inode.child_vdi_id.clear();
        inode.snap_id = base.as_ref().map(|b| b.snap_id + 1).unwrap_or(1);
        if req.vdi_size != 0 {
            inode.vdi_size = req.vdi_size;
        }

        if let Some(mut b) = base {
            if req.snapid != 0 && !b.is_snapshot() {
                b.snap_ctime = self.tick() | 1;
            }
            b.child_vdi_id.push(vid);
            // the lock follows the name to the new VDI
            if self.locked.remove(&b.vdi_id) {
                self.locked.insert(vid);
            }
            self.objects.insert(ObjectId::from_vid(b.vdi_id), b.encode());
        }
        self.objects.insert(ObjectId::from_vid(vid), inode.encode());
        self.live.insert(vid);
        Ok(vid)
    }

    fn read_obj(&self, req: &ObjRequest) -> SdResult<Vec<u8>> {
        let obj = self.objects.get(&req.oid).ok_or(SdError::NoObj)?;
        let len = req.hdr.data_length as usize;
        let start = (req.offset as usize).min(obj.len());
        let end = (start + len).min(obj.len());
        let mut data = obj[start..end].to_vec();
        data.resize(len, 0);
        Ok(data)
    }

    fn write_obj(&mut self, req: &ObjRequest, payload: &[u8], create: bool) -> SdResult<()> {
        if req.oid.is_data_obj() {
            if let Some(e) = self.write_errors.pop_front() {
                return Err(e);
            }
        }
        if (req.oid.is_data_obj() || req.oid.is_vdi_obj()) && self.is_snapshot(req.oid.to_vid()) {
            return Err(SdError::ReadOnly);
        }
        if self.discard_unsupported
            && req.oid.is_vdi_obj()
            && req.offset >= SD_INODE_HEADER_SIZE as u64
            && payload.len() == 4
            && payload.iter().all(|&b| b == 0)
        {
            return Err(SdError::InvalidParms);
        }

        let mut obj = if create {
            if req.hdr.flags & SD_FLAG_CMD_COW != 0 {
                self.objects.get(&req.cow_oid).cloned().ok_or(SdError::NoObj)?
            } else {
                Vec::new()
            }
        } else {
            self.objects.remove(&req.oid).ok_or(SdError::NoObj)?
        };
        let start = req.offset as usize;
        if obj.len() < start + payload.len() {
            obj.resize(start + payload.len(), 0);
        }
        obj[start..start + payload.len()].copy_from_slice(payload);
        self.objects.insert(req.oid, obj);
        Ok(())
    }

    fn handle_obj(&mut self, conn: usize, opcode: Opcode, hdr: &[u8; SD_HEADER_SIZE], payload: Vec<u8>) -> (SdResponse, Vec<u8>) {
        let req = ObjRequest::from_bytes(hdr);
        self.log.push(LoggedRequest {
            conn,
            id: req.hdr.id,
            opcode,
            flags: req.hdr.flags,
            oid: req.oid,
            cow_oid: req.cow_oid,
            offset: req.offset,
            len: req.hdr.data_length,
            payload: payload.clone(),
        });

        let res = match opcode {
            Opcode::ReadObj => self.read_obj(&req),
            Opcode::WriteObj => self.write_obj(&req, &payload, false).map(|_| Vec::new()),
            Opcode::CreateAndWriteObj => self.write_obj(&req, &payload, true).map(|_| Vec::new()),
            _ if self.flush_unsupported => Err(SdError::InvalidParms),
            _ => Ok(Vec::new()),
        };
        match res {
            Ok(data) => {
                let mut rsp = SdResponse::new(opcode, req.hdr.id, Ok(()));
                rsp.data_length = data.len() as u32;
                (rsp, data)
            }
            Err(e) => (SdResponse::new(opcode, req.hdr.id, Err(e)), Vec::new()),
        }
    }

    fn handle_vdi(&mut self, opcode: Opcode, hdr: &[u8; SD_HEADER_SIZE], payload: &[u8]) -> (SdResponse, Vec<u8>) {
        let req = VdiRequest::from_bytes(hdr);
        let name = cstr(&payload[..payload.len().min(SD_MAX_VDI_LEN)]);
        let tag = if payload.len() > SD_MAX_VDI_LEN {
            cstr(&payload[SD_MAX_VDI_LEN..])
        } else {
            String::new()
        };
        let id = req.hdr.id;

        let res: SdResult<(u32, Vec<u8>)> = match opcode {
            Opcode::GetVdiInfo => self.lookup(&name, req.snapid, &tag).map(|vid| (vid, Vec::new())),
            Opcode::LockVdi => self.lookup(&name, req.snapid, &tag).and_then(|vid| {
                if req.lock_type == LOCK_TYPE_NORMAL && !self.locked.insert(vid) {
                    return Err(SdError::VdiLocked);
                }
                Ok((vid, Vec::new()))
            }),
            Opcode::ReleaseVdi => {
                if self.locked.remove(&req.base_vdi_id) {
                    Ok((0, Vec::new()))
                } else {
                    Err(SdError::VdiNotLocked)
                }
            }
            Opcode::NewVdi => self.new_vdi(&name, &req).map(|vid| (vid, Vec::new())),
            Opcode::DelVdi => self.lookup(&name, req.snapid, &tag).map(|vid| {
                self.live.remove(&vid);
                self.locked.remove(&vid);
                (vid, Vec::new())
            }),
            Opcode::ReadVdis => {
                let mut bitmap = vec![0u8; SD_NR_VDIS as usize / 8];
                for &vid in &self.live {
                    bitmap[vid as usize / 8] |= 1 << (vid % 8);
                }
                Ok((0, bitmap))
            }
            _ => {
                let defaults = ClusterDefaults {
                    nr_copies: SD_DEFAULT_COPIES,
                    copy_policy: 0,
                    block_size_shift: SD_DEFAULT_BLOCK_SIZE_SHIFT,
                };
                let rsp = SdResponse::new(opcode, id, Ok(())).with_cluster_defaults(defaults);
                return (rsp, Vec::new());
            }
        };
        match res {
            Ok((vid, data)) => {
                let mut rsp = SdResponse::new(opcode, id, Ok(())).with_vdi_id(vid);
                rsp.data_length = data.len() as u32;
                (rsp, data)
            }
            Err(e) => (SdResponse::new(opcode, id, Err(e)), Vec::new()),
        }
    }

    /// Handle one request. Returns the response frame, or `None` if it
    /// was held back.
    fn handle(&mut self, conn: usize, hdr: &[u8; SD_HEADER_SIZE], payload: Vec<u8>) -> Option<Vec<u8>> {
        let opcode = Opcode::from_u8(hdr[1])?;
        let (rsp, data) = match opcode {
            Opcode::ReadObj | Opcode::WriteObj | Opcode::CreateAndWriteObj | Opcode::FlushVdi => {
                self.handle_obj(conn, opcode, hdr, payload)
            }
            _ => self.handle_vdi(opcode, hdr, &payload),
        };

        let mut frame = rsp.to_bytes().to_vec();
        frame.extend_from_slice(&data);

        let data_op = matches!(
            opcode,
            Opcode::ReadObj | Opcode::WriteObj | Opcode::CreateAndWriteObj
        );
        if self.hold && data_op && ObjRequest::from_bytes(hdr).oid.is_data_obj() {
            self.held.push((conn, frame));
            return None;
        }
        Some(frame)
    }
}

async fn serve(
    inner: Arc<Inner>,
    conn: usize,
    mut reader: ReadHalf<DuplexStream>,
    writer: ServerWriter,
) {
    loop {
        let mut hdr = [0u8; SD_HEADER_SIZE];
        if reader.read_exact(&mut hdr).await.is_err() {
            break;
        }
        let base = RequestHeader::from_bytes(&hdr);
        if base.proto_ver != SD_PROTO_VER || Opcode::from_u8(base.opcode).is_none() {
            inner.state.lock().malformed += 1;
            break;
        }
        let mut payload = vec![0u8; if base.has_payload() { base.data_length as usize } else { 0 }];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }

        let frame = inner.state.lock().handle(conn, &hdr, payload);
        if let Some(frame) = frame {
            if writer.lock().await.write_all(&frame).await.is_err() {
                break;
            }
        }
    }
    inner.conns.lock().remove(&conn);
}

#[async_trait]
impl Connector for FakeConnector {
    fn name(&self) -> String {
        "fake-sheep".to_string()
    }

    async fn connect(&self) -> SdResult<Connection> {
        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(SdError::NetworkError);
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        let (server_reader, server_writer) = tokio::io::split(server);
        let writer: ServerWriter = Arc::new(tokio::sync::Mutex::new(server_writer));

        let conn = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        let mut conns = self.inner.conns.lock();
        let task = tokio::spawn(serve(
            Arc::clone(&self.inner),
            conn,
            server_reader,
            Arc::clone(&writer),
        ));
        conns.insert(conn, (writer, task));
        drop(conns);

        let (reader, writer) = tokio::io::split(client);
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                conns: Mutex::new(HashMap::new()),
                next_conn: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                connect_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Create a writable VDI with 4 MB objects.
    pub(crate) fn add_vdi(&self, name: &str, size: u64) -> u32 {
        self.add_vdi_with_shift(name, size, 0)
    }

    /// Create a writable VDI with `1 << shift` byte objects, or the
    /// cluster default when `shift` is 0.
    pub(crate) fn add_vdi_with_shift(&self, name: &str, size: u64, shift: u8) -> u32 {
        let mut req = VdiRequest::new(Opcode::NewVdi);
        req.vdi_size = size;
        req.block_size_shift = shift;
        self.inner
            .state
            .lock()
            .new_vdi(name, &req)
            .expect("vdi created")
    }

    /// Snapshot the working VDI of `name` behind the driver's back, as
    /// another client would. Returns the new working VDI.
    pub(crate) fn promote(&self, name: &str) -> u32 {
        let mut st = self.inner.state.lock();
        let base = st.working_vdi(name).expect("working vdi");
        let mut req = VdiRequest::new(Opcode::NewVdi);
        req.base_vdi_id = base;
        req.snapid = 1;
        st.new_vdi(name, &req).expect("snapshot created")
    }

    pub(crate) fn working_vdi(&self, name: &str) -> Option<u32> {
        self.inner.state.lock().working_vdi(name)
    }

    pub(crate) fn inode(&self, vid: u32) -> SdInode {
        self.inner.state.lock().inode(vid).expect("inode exists")
    }

    pub(crate) fn object(&self, oid: ObjectId) -> Option<Vec<u8>> {
        self.inner.state.lock().objects.get(&oid).cloned()
    }

    pub(crate) fn is_locked(&self, vid: u32) -> bool {
        self.inner.state.lock().locked.contains(&vid)
    }

    pub(crate) fn log(&self) -> Vec<LoggedRequest> {
        self.inner.state.lock().log.clone()
    }

    /// Logged requests addressed to data objects.
    pub(crate) fn data_log(&self) -> Vec<LoggedRequest> {
        self.log().into_iter().filter(|r| r.oid.is_data_obj()).collect()
    }

    pub(crate) fn clear_log(&self) {
        self.inner.state.lock().log.clear();
    }

    pub(crate) fn malformed(&self) -> usize {
        self.inner.state.lock().malformed
    }

    /// Fail the next data object writes with `errors`, in order.
    pub(crate) fn inject_write_errors(&self, errors: impl IntoIterator<Item = SdError>) {
        self.inner.state.lock().write_errors.extend(errors);
    }

    pub(crate) fn set_flush_unsupported(&self, on: bool) {
        self.inner.state.lock().flush_unsupported = on;
    }

    pub(crate) fn set_discard_unsupported(&self, on: bool) {
        self.inner.state.lock().discard_unsupported = on;
    }

    /// Keep responses to data object requests until released.
    pub(crate) fn hold_data(&self, on: bool) {
        self.inner.state.lock().hold = on;
    }

    pub(crate) fn held(&self) -> usize {
        self.inner.state.lock().held.len()
    }

    /// Send every held response on its connection, if still open.
    pub(crate) async fn release_held(&self) {
        let held = std::mem::take(&mut self.inner.state.lock().held);
        for (conn, frame) in held {
            let writer = self.inner.conns.lock().get(&conn).map(|(w, _)| Arc::clone(w));
            if let Some(writer) = writer {
                let _ = writer.lock().await.write_all(&frame).await;
            }
        }
    }

    /// Drop every open connection. Held responses are discarded.
    pub(crate) fn break_connections(&self) {
        self.inner.state.lock().held.clear();
        let conns: Vec<_> = self.inner.conns.lock().drain().collect();
        for (_, (_, task)) in conns {
            task.abort();
        }
    }

    pub(crate) fn refuse_connections(&self, on: bool) {
        self.inner.refuse.store(on, Ordering::SeqCst);
    }

    /// Make every new connection take `delay` to come up.
    pub(crate) fn delay_connections(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Number of connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.inner.next_conn.load(Ordering::SeqCst)
    }
}
