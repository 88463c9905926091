//! Mutex-guarded bookkeeping for one multiplexed socket: the slot table,
//! queued operations, side statuses and the recorded first error.
//!
//! The lock is only ever held for O(1)-ish bookkeeping between I/O steps,
//! never across a stream transfer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Nothing queued; the task is parked.
    Idle,
    /// Operations pending or a transfer in flight.
    InUse,
    /// The reader holds a data header and is parked until a matching
    /// receive is posted.
    RequestedRecvOp,
    Closed,
}

/// Completion hook shared by every op pending at the time of a `flush`.
/// The last op to drop its reference settles the flush.
pub(crate) struct FlushGuard {
    tx: Option<oneshot::Sender<()>>,
}

impl FlushGuard {
    pub(crate) fn new(tx: oneshot::Sender<()>) -> FlushGuard {
        FlushGuard { tx: Some(tx) }
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

pub(crate) struct SendOp {
    pub(crate) id: u64,
    /// Owned outbound payload; the writer takes it when transmission starts.
    pub(crate) buf: Vec<u8>,
    pub(crate) done: Option<oneshot::Sender<Result<(), MuxError>>>,
    pub(crate) in_progress: bool,
    pub(crate) flushes: Vec<Arc<FlushGuard>>,
}

impl SendOp {
    /// Resume the caller and release any flush references.
    pub(crate) fn finish(mut self, res: Result<(), MuxError>) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(res);
        }
    }
}

pub(crate) struct RecvOp {
    pub(crate) id: u64,
    /// Destination buffer, moved back to the caller on completion.
    pub(crate) buf: Vec<u8>,
    /// When set, the frame size must equal the posted buffer length.
    /// `recv_any` ops instead adopt the size from the header.
    pub(crate) exact: bool,
    pub(crate) done: Option<oneshot::Sender<Result<Vec<u8>, MuxError>>>,
    pub(crate) in_progress: bool,
    pub(crate) flushes: Vec<Arc<FlushGuard>>,
}

impl RecvOp {
    pub(crate) fn finish(mut self, res: Result<Vec<u8>, MuxError>) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(res);
        }
    }
}

/// Per-fork record. Slots are created on first local mention or first remote
/// announcement and live until socket teardown.
pub(crate) struct Slot {
    pub(crate) session: SessionId,
    pub(crate) local_id: u32,
    pub(crate) remote_id: Option<u32>,
    /// False until the peer has been told about this slot; the next send
    /// must lead with a NewSlot block while false.
    pub(crate) initiated: bool,
    pub(crate) closed: bool,
    pub(crate) fork_count: u64,
    pub(crate) send_ops: VecDeque<SendOp>,
    pub(crate) recv_ops: VecDeque<RecvOp>,
}

impl Slot {
    fn new(session: SessionId, local_id: u32) -> Slot {
        Slot {
            session,
            local_id,
            remote_id: None,
            initiated: false,
            closed: false,
            fork_count: 0,
            send_ops: VecDeque::new(),
            recv_ops: VecDeque::new(),
        }
    }
}

pub(crate) struct State {
    pub(crate) slots: Vec<Slot>,
    pub(crate) by_session: HashMap<SessionId, usize>,
    pub(crate) by_remote: HashMap<u32, usize>,
    /// One entry per queued send op, in global FIFO order; the head op of
    /// the head slot is the one being (or next to be) written.
    pub(crate) send_queue: VecDeque<usize>,
    pub(crate) send_status: Status,
    pub(crate) recv_status: Status,
    pub(crate) num_recvs: u64,
    pub(crate) next_local_slot: u32,
    pub(crate) next_op_id: u64,
    /// First error observed; reused for every op failed afterwards.
    pub(crate) error: Option<MuxError>,
    pub(crate) send_stop: CancellationToken,
    pub(crate) recv_stop: CancellationToken,
    pub(crate) stream_closed: bool,
}

impl State {
    pub(crate) fn new() -> State {
        State {
            slots: Vec::new(),
            by_session: HashMap::new(),
            by_remote: HashMap::new(),
            send_queue: VecDeque::new(),
            send_status: Status::Idle,
            recv_status: Status::Idle,
            num_recvs: 0,
            next_local_slot: 1,
            next_op_id: 1,
            error: None,
            send_stop: CancellationToken::new(),
            recv_stop: CancellationToken::new(),
            stream_closed: false,
        }
    }

    /// The error a newly submitted or force-failed op should carry.
    pub(crate) fn op_error(&self) -> MuxError {
        self.error.clone().unwrap_or(MuxError::Closed)
    }

    /// Look up the slot for `id`, creating it (and allocating a local slot
    /// number) on first mention.
    pub(crate) fn slot_for(&mut self, id: SessionId) -> Result<usize, MuxError> {
        if let Some(&key) = self.by_session.get(&id) {
            if self.slots[key].closed {
                return Err(MuxError::Closed);
            }
            return Ok(key);
        }
        let key = self.slots.len();
        let local_id = self.next_local_slot;
        self.next_local_slot += 1;
        self.slots.push(Slot::new(id, local_id));
        self.by_session.insert(id, key);
        Ok(key)
    }

    /// Install the peer's slot binding from a NewSlot announcement.
    /// Each remote slot number binds exactly once.
    pub(crate) fn bind_remote(&mut self, remote_id: u32, id: SessionId) -> Result<(), MuxError> {
        if self.by_remote.contains_key(&remote_id) {
            return Err(MuxError::BadHeader);
        }
        let key = match self.by_session.get(&id) {
            Some(&key) => {
                if self.slots[key].remote_id.is_some() {
                    return Err(MuxError::BadHeader);
                }
                key
            }
            None => {
                let key = self.slots.len();
                let local_id = self.next_local_slot;
                self.next_local_slot += 1;
                self.slots.push(Slot::new(id, local_id));
                self.by_session.insert(id, key);
                key
            }
        };
        self.slots[key].remote_id = Some(remote_id);
        self.by_remote.insert(remote_id, key);
        Ok(())
    }
}
