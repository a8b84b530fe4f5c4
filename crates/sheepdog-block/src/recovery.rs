//! Failure recovery on the data connection.
//!
//! When the connection breaks, every in-flight request is moved to the
//! replay queue, where it can still be canceled. A new connection is
//! opened (retrying until it works) and the queue is replayed in id
//! order, with the copy-on-write decision recomputed against the current
//! owner table. Requests answered with READONLY are redirected to the VDI
//! that now owns the name.

use std::sync::Arc;

use sheepdog_proto::ObjectId;
use tracing::{debug, error, info, warn};

use crate::aio::{AioOp, SubKind, SubRequest};
use crate::session::Session;

impl Session {
    /// Start recovery of the connection at `generation` in the background.
    pub(crate) fn spawn_recovery(self: &Arc<Self>, generation: u64) {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.recover(generation).await });
    }

    async fn recover(self: Arc<Self>, generation: u64) {
        let _recovery = self.recovery.lock().await;

        let mut link = self.link.lock().await;
        if link.generation != generation || self.is_closed() {
            debug!("connection {} already recovered", generation);
            return;
        }
        link.writer = None;
        self.stop_receiver().await;

        // The link lock is held until the new connection is installed, so
        // nothing can enter the in-flight table meanwhile.
        let nr_failed = {
            let mut table = self.table.lock();
            let inflight = std::mem::take(&mut table.inflight);
            table.failed.extend(inflight);
            table.failed.len()
        };

        warn!(
            "reconnecting to {}, {} requests to replay",
            self.admin.connector().name(),
            nr_failed
        );
        let conn = loop {
            if self.is_closed() {
                return;
            }
            match self.admin.connector().connect().await {
                Ok(conn) => break conn,
                Err(e) => {
                    error!("failed to reconnect to {}: {}", self.admin.connector().name(), e);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        };

        link.generation += 1;
        link.writer = Some(conn.writer);
        self.start_receiver(conn.reader, link.generation);
        drop(link);

        info!("reconnected to {}", self.admin.connector().name());
        self.replay().await;
    }

    async fn replay(self: &Arc<Self>) {
        loop {
            let next = self.table.lock().failed.pop_first();
            let Some((_, sub)) = next else {
                break;
            };
            self.resend(sub).await;
        }
    }

    /// Send `sub` again, recomputing whether it must create its object.
    pub(crate) async fn resend(self: &Arc<Self>, mut sub: SubRequest) {
        sub.create = false;
        if sub.kind == SubKind::Write && sub.oid.is_data_obj() {
            let vdi = self.vdi.read();
            let idx = sub.oid.data_index();
            if vdi.inode.is_data_obj_writable(idx) {
                sub.base_oid = ObjectId::NONE;
            } else {
                let owner = vdi.inode.get_vid(idx);
                if owner != 0 {
                    sub.base_oid = ObjectId::from_vid_data(owner, idx);
                }
                sub.create = true;
            }
        }
        self.requeue(sub).await;
    }

    /// Redirect a request rejected as read-only to the current working
    /// VDI of this name.
    ///
    /// The operation stays uncancelable until the request is back in the
    /// in-flight table.
    pub(crate) async fn follow_readonly(self: Arc<Self>, mut sub: SubRequest) {
        let op = Arc::clone(&sub.op);
        let cached = self.vdi.read().inode.vdi_id;
        if sub.oid.to_vid() == cached {
            if let Err(e) = self.reload_inode(0, "").await {
                error!("cannot reload inode of {}: {}", self.name, e);
                let generation = {
                    let link = self.link.lock().await;
                    self.table.lock().inflight.insert(sub.id, sub);
                    link.generation
                };
                op.end_follow();
                self.spawn_recovery(generation);
                return;
            }
        }

        let vid = self.vdi.read().inode.vdi_id;
        let oid = sub.oid.retarget(vid);
        debug!("request {}: {} -> {}", sub.id, sub.oid, oid);
        sub.oid = oid;
        self.resend(sub).await;
        op.end_follow();
    }

    /// Cancel `op` if none of its requests is on the wire.
    ///
    /// Only an operation whose requests all wait in the replay queue, and
    /// none of which has completed, can be canceled.
    pub(crate) fn cancel(&self, op: &Arc<AioOp>) -> bool {
        let mut table = self.table.lock();
        if !op.is_cancelable() {
            return false;
        }
        if table.inflight.values().any(|s| Arc::ptr_eq(&s.op, op)) {
            return false;
        }
        let ids: Vec<u32> = table
            .failed
            .iter()
            .filter(|(_, s)| Arc::ptr_eq(&s.op, op))
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            table.failed.remove(id);
        }
        op.cancel(ids.len());
        info!("canceled op {} ({} queued requests dropped)", op.id, ids.len());
        true
    }
}
