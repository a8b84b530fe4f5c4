//! The block-device surface.
//!
//! A [`SheepdogDevice`] is one open VDI. All data I/O goes through the
//! session's persistent connection; every operation runs in its own task
//! so that it completes (or is canceled) even if the caller stops
//! waiting for it.

use std::sync::Arc;

use sheepdog_core::inode::{allocated_size, block_status, BlockStatus};
use sheepdog_core::socket_transport::SocketConnector;
use sheepdog_core::transport::Connector;
use sheepdog_proto::SdInode;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admin::AdminClient;
use crate::aio::{AioOp, OpKind};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::location::VdiLocation;
use crate::session::Session;
use crate::snapshot::SnapshotInfo;

/// An operation running in the background.
pub struct IoHandle<T> {
    op: Arc<AioOp>,
    session: Arc<Session>,
    task: JoinHandle<DriverResult<T>>,
}

impl<T> IoHandle<T> {
    /// Try to cancel the operation. This only succeeds while none of its
    /// requests is on the wire, e.g. while the connection is being
    /// re-established; the operation then finishes with `Canceled`.
    pub fn cancel(&self) -> bool {
        self.session.cancel(&self.op)
    }

    pub async fn wait(self) -> DriverResult<T> {
        match self.task.await {
            Ok(res) => res,
            Err(e) => {
                warn!("op {} task failed: {}", self.op.id, e);
                Err(DriverError::Io)
            }
        }
    }
}

/// An open VDI.
pub struct SheepdogDevice {
    session: Arc<Session>,
    location: VdiLocation,
    config: DriverConfig,
}

impl SheepdogDevice {
    /// Open the VDI at `location` over a TCP or Unix-domain socket.
    pub async fn open(location: &str, config: DriverConfig) -> DriverResult<Self> {
        let location = VdiLocation::parse(location)?;
        let connector: Arc<dyn Connector> = Arc::new(SocketConnector::new(location.host.clone()));
        Self::open_with_connector(connector, location, config).await
    }

    /// Open the VDI at `location`, reaching the daemon through `connector`.
    pub async fn open_with_connector(
        connector: Arc<dyn Connector>,
        location: VdiLocation,
        config: DriverConfig,
    ) -> DriverResult<Self> {
        let admin = AdminClient::new(connector);
        let session = Session::connect(admin.clone(), &location.vdi, &config).await?;

        let vid = match admin
            .find_vdi(&location.vdi, location.snap_id, &location.tag, Some(config.lock_type))
            .await
        {
            Ok(vid) => vid,
            Err(e) => {
                session.shutdown().await;
                return Err(e);
            }
        };

        let flags = session.vdi.read().cache_flags;
        let inode = match admin.read_inode(vid, 0, false, flags).await {
            Ok(inode) => inode,
            Err(e) => {
                let _ = admin.release_vdi(&location.vdi, vid).await;
                session.shutdown().await;
                return Err(e);
            }
        };

        {
            let mut vdi = session.vdi.write();
            vdi.inode = inode;
            vdi.is_snapshot = location.is_snapshot();
        }
        info!(
            "opened {} (vdi {:#x}{}) on {}",
            location.vdi,
            vid,
            if location.is_snapshot() { ", snapshot" } else { "" },
            admin.connector().name()
        );

        Ok(Self {
            session,
            location,
            config,
        })
    }

    /// Release the VDI lock and drop the data connection.
    pub async fn close(self) -> DriverResult<()> {
        let vid = self.session.vdi.read().inode.vdi_id;
        let res = self.session.admin.release_vdi(&self.location.vdi, vid).await;
        if let Err(e) = &res {
            warn!("failed to release {}: {}", self.location.vdi, e);
        }
        self.session.shutdown().await;
        debug!("closed {}", self.location.vdi);
        res
    }

    /// Switch to a fresh data connection and the cache mode of `config`.
    ///
    /// No I/O may be outstanding. On failure the device keeps its
    /// current connection and settings.
    pub async fn reopen(&mut self, config: DriverConfig) -> DriverResult<()> {
        let connector = Arc::clone(self.session.admin.connector());
        let conn = connector
            .connect()
            .await
            .map_err(|_| DriverError::Transport(connector.name()))?;

        if self.session.has_outstanding() {
            return Err(DriverError::Busy(format!(
                "{} has requests in flight",
                self.location.vdi
            )));
        }
        self.session.swap_link(conn).await;
        self.session.vdi.write().cache_flags = config.cache_mode.request_flags();
        self.config = config;
        Ok(())
    }

    pub fn location(&self) -> &VdiLocation {
        &self.location
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn vdi_id(&self) -> u32 {
        self.session.vdi.read().inode.vdi_id
    }

    /// Whether writes will first branch off a snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.session.vdi.read().is_snapshot
    }

    /// The cached inode, owner table included.
    pub fn inode(&self) -> SdInode {
        self.session.inode_snapshot()
    }

    pub fn length(&self) -> u64 {
        self.session.vdi.read().inode.vdi_size
    }

    /// Grow the device to `size` bytes.
    pub async fn truncate(&self, size: u64) -> DriverResult<()> {
        let (mut header, flags) = {
            let vdi = self.session.vdi.read();
            (vdi.inode.header_clone(), vdi.cache_flags)
        };
        if size < header.vdi_size {
            return Err(DriverError::InvalidArgument(
                "shrinking is not supported".to_string(),
            ));
        }
        if size > header.max_vdi_size() {
            return Err(DriverError::InvalidArgument(format!(
                "{} bytes is too big, the maximum is {}",
                size,
                header.max_vdi_size()
            )));
        }

        header.vdi_size = size;
        self.session.admin.write_inode_header(&header, flags).await?;
        self.session.vdi.write().inode.vdi_size = size;
        debug!("{} resized to {}", self.location.vdi, size);
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> DriverResult<()> {
        let size = self.length();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(DriverError::InvalidArgument(format!(
                "range {}+{} beyond device end {}",
                offset, len, size
            ))),
        }
    }

    fn new_op(&self, kind: OpKind, offset: u64, len: u64, buf: Vec<u8>) -> Arc<AioOp> {
        let obj_size = self.session.vdi.read().inode.object_size();
        Arc::new(AioOp::new(
            self.session.next_op_id(),
            kind,
            offset,
            len,
            obj_size,
            buf,
        ))
    }

    fn spawn(&self, op: Arc<AioOp>) -> IoHandle<()> {
        let session = Arc::clone(&self.session);
        let task_op = Arc::clone(&op);
        let task = tokio::spawn(async move { session.execute(task_op).await });
        IoHandle {
            op,
            session: Arc::clone(&self.session),
            task,
        }
    }

    /// Start reading `len` bytes at `offset`.
    pub fn submit_read(&self, offset: u64, len: usize) -> DriverResult<IoHandle<Vec<u8>>> {
        self.check_range(offset, len as u64)?;
        let op = self.new_op(OpKind::Read, offset, len as u64, vec![0u8; len]);

        let session = Arc::clone(&self.session);
        let task_op = Arc::clone(&op);
        let task = tokio::spawn(async move {
            session.execute(Arc::clone(&task_op)).await?;
            Ok(task_op.take_buf())
        });
        Ok(IoHandle {
            op,
            session: Arc::clone(&self.session),
            task,
        })
    }

    /// Start writing `data` at `offset`, growing the device if needed.
    pub async fn submit_write(&self, offset: u64, data: Vec<u8>) -> DriverResult<IoHandle<()>> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| DriverError::InvalidArgument("write past the address space".into()))?;
        if end > self.length() {
            self.truncate(end).await?;
        }
        let op = self.new_op(OpKind::Write, offset, data.len() as u64, data);
        Ok(self.spawn(op))
    }

    pub async fn read(&self, offset: u64, len: usize) -> DriverResult<Vec<u8>> {
        self.submit_read(offset, len)?.wait().await
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> DriverResult<()> {
        self.submit_write(offset, data.to_vec()).await?.wait().await
    }

    /// Drop the objects fully covered by `offset..offset + len`.
    pub async fn discard(&self, offset: u64, len: u64) -> DriverResult<()> {
        self.check_range(offset, len)?;
        let op = self.new_op(OpKind::Discard, offset, len, Vec::new());
        self.spawn(op).wait().await
    }

    /// Ask the daemon to persist its cached writes of this VDI.
    pub async fn flush(&self) -> DriverResult<()> {
        let op = self.new_op(OpKind::Flush, 0, 0, Vec::new());
        self.spawn(op).wait().await
    }

    pub fn block_status(&self, offset: u64, len: u64) -> BlockStatus {
        block_status(&self.session.vdi.read().inode, offset, len)
    }

    pub fn allocated_size(&self) -> u64 {
        allocated_size(&self.session.vdi.read().inode)
    }

    pub async fn snapshot_create(
        &self,
        tag: &str,
        vm_state_size: u64,
        vm_clock_nsec: u64,
    ) -> DriverResult<()> {
        self.session.snapshot_create(tag, vm_state_size, vm_clock_nsec).await
    }

    /// Revert to snapshot `snapshot` (id or tag) on a new writable VDI.
    pub async fn snapshot_goto(&self, snapshot: &str) -> DriverResult<()> {
        self.session.snapshot_goto(snapshot).await
    }

    pub async fn snapshot_delete(&self, snapshot: &str) -> DriverResult<()> {
        self.session.snapshot_delete(snapshot).await
    }

    pub async fn snapshot_list(&self) -> DriverResult<Vec<SnapshotInfo>> {
        self.session.snapshot_list(self.config.snapshot_list_max).await
    }

    pub async fn save_vmstate(&self, data: &[u8], pos: u64) -> DriverResult<usize> {
        self.session.save_vmstate(data, pos).await
    }

    pub async fn load_vmstate(&self, pos: u64, len: usize) -> DriverResult<Vec<u8>> {
        self.session.load_vmstate(pos, len).await
    }
}
