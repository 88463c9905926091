//! Multiplexing socket scheduler.
//!
//! Many semi-independent protocol forks share one underlying byte stream.
//! Every frame carries an 8-byte header so the peer can route it: a data
//! frame is `[size, slot-id, payload]` with a non-zero size, and a meta
//! frame is `[0, slot-id, control]`, the zero size word being what marks it
//! as control-plane. The only control block is NewSlot, which binds a
//! 128-bit fork [`SessionId`] to the 32-bit slot number the sender chose
//! for it; after that one announcement the slot number alone routes every
//! frame of the fork. The two parties may map the same fork to different
//! slot numbers.
//!
//! Sends are queued per fork and drained by a single writer task, so bytes
//! of different forks never interleave inside a frame. The reader task runs
//! header-driven: when a frame arrives for a fork whose receive queue is
//! empty, the reader parks until a matching receive is posted; receives
//! for other forks simply wait behind it.
//!
//! Buffers move into the socket on send, which means an op can be queued
//! long after the caller stopped looking at it; [`MuxSocket::flush`] is how
//! callers wait for everything pending to settle. Cancellation is two-tier:
//! a queued op is failed and removed immediately, while an op that is
//! already half on the wire is stopped cooperatively and the socket
//! transmits (or drains) the rest of the frame later, because the peer is
//! committed to a whole frame once its header is out.

mod reader;
mod state;
mod writer;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;
use crate::session::SessionId;
use crate::stream::ByteStream;

use state::{FlushGuard, RecvOp, SendOp, State, Status};

/// State shared between the socket handle and its writer/reader tasks.
pub(crate) struct Shared<S: ByteStream> {
    pub(crate) stream: S,
    pub(crate) state: Mutex<State>,
    pub(crate) send_wake: Notify,
    pub(crate) recv_wake: Notify,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) logging: AtomicBool,
}

impl<S: ByteStream> Shared<S> {
    pub(crate) fn logging(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    /// Move the socket to its terminal state: record the error, fail every
    /// pending op with it, close the stream exactly once and stop both
    /// tasks. Idempotent.
    pub(crate) fn close_with(&self, e: MuxError) {
        let mut close_stream = false;
        let send_stop;
        let recv_stop;
        {
            let mut st = self.state.lock().unwrap();
            if st.send_status == Status::Closed && st.recv_status == Status::Closed {
                return;
            }
            st.error.get_or_insert(e);
            let err = st.error.clone().expect("just stored");
            st.send_status = Status::Closed;
            st.recv_status = Status::Closed;
            st.send_queue.clear();
            st.num_recvs = 0;
            for slot in &mut st.slots {
                slot.closed = true;
                for op in slot.send_ops.drain(..) {
                    op.finish(Err(err.clone()));
                }
                for op in slot.recv_ops.drain(..) {
                    op.finish(Err(err.clone()));
                }
            }
            send_stop = st.send_stop.clone();
            recv_stop = st.recv_stop.clone();
            if !st.stream_closed {
                st.stream_closed = true;
                close_stream = true;
            }
        }
        if close_stream {
            self.stream.close();
        }
        send_stop.cancel();
        recv_stop.cancel();
        self.send_wake.notify_one();
        self.recv_wake.notify_one();
    }
}

/// A byte stream multiplexed into independently addressable protocol forks.
///
/// The handle is cheap to share by reference; all methods take `&self`.
/// Dropping the socket while operations are still in flight is a programmer
/// error and aborts the process; await [`MuxSocket::flush`] first.
pub struct MuxSocket<S: ByteStream> {
    shared: Arc<Shared<S>>,
}

impl<S: ByteStream> MuxSocket<S> {
    /// Take ownership of `stream` and start the writer and reader tasks.
    /// Must be called from within a tokio runtime.
    ///
    /// `root` names the initial fork; both peers must construct their
    /// socket with the same root id.
    pub fn new(stream: S, root: SessionId) -> MuxSocket<S> {
        let shared = Arc::new(Shared {
            stream,
            state: Mutex::new(State::new()),
            send_wake: Notify::new(),
            recv_wake: Notify::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            logging: AtomicBool::new(false),
        });
        shared
            .state
            .lock()
            .unwrap()
            .slot_for(root)
            .expect("fresh socket accepts its root fork");
        tokio::spawn(writer::writer_task(shared.clone()));
        tokio::spawn(reader::reader_task(shared.clone()));
        MuxSocket { shared }
    }

    /// Derive a child fork id from `parent`. Purely local: both peers
    /// derive the same child by forking the same parent in the same order,
    /// and the peer learns the slot binding from the first frame sent on
    /// the child.
    pub fn fork(&self, parent: SessionId) -> Result<SessionId, MuxError> {
        let mut st = self.shared.state.lock().unwrap();
        if st.send_status == Status::Closed {
            return Err(st.op_error());
        }
        let key = st.slot_for(parent)?;
        let slot = &mut st.slots[key];
        let child = slot.session.derive_child(slot.fork_count);
        slot.fork_count += 1;
        Ok(child)
    }

    /// Queue `buf` for sending on fork `id` without waiting for the wire.
    /// Completion is observed collectively through [`MuxSocket::flush`].
    pub fn post(&self, id: SessionId, buf: Vec<u8>) -> Result<(), MuxError> {
        self.enqueue_send(id, buf).map(|_| ())
    }

    /// Send `buf` on fork `id`. Resolves once the payload is fully written
    /// to the underlying stream.
    pub async fn send(&self, id: SessionId, buf: Vec<u8>) -> Result<(), MuxError> {
        let (_op, rx) = self.enqueue_send(id, buf)?;
        rx.await.unwrap_or(Err(MuxError::Closed))
    }

    /// [`MuxSocket::send`] with caller-controlled cancellation.
    pub async fn send_with(
        &self,
        id: SessionId,
        buf: Vec<u8>,
        token: CancellationToken,
    ) -> Result<(), MuxError> {
        let (op_id, mut rx) = self.enqueue_send(id, buf)?;
        tokio::select! {
            biased;
            res = &mut rx => res.unwrap_or(Err(MuxError::Closed)),
            _ = token.cancelled() => {
                self.cancel_send(id, op_id);
                rx.await.unwrap_or(Err(MuxError::Closed))
            }
        }
    }

    /// Receive the next frame on fork `id` into `buf`, whose length must
    /// equal the frame's size exactly; a disagreement is a protocol error
    /// that closes the socket. The filled buffer is returned.
    pub async fn recv(&self, id: SessionId, buf: Vec<u8>) -> Result<Vec<u8>, MuxError> {
        let (_op, rx) = self.enqueue_recv(id, buf, true)?;
        rx.await.unwrap_or(Err(MuxError::Closed))
    }

    /// [`MuxSocket::recv`] with caller-controlled cancellation.
    pub async fn recv_with(
        &self,
        id: SessionId,
        buf: Vec<u8>,
        token: CancellationToken,
    ) -> Result<Vec<u8>, MuxError> {
        let (op_id, mut rx) = self.enqueue_recv(id, buf, true)?;
        tokio::select! {
            biased;
            res = &mut rx => res.unwrap_or(Err(MuxError::Closed)),
            _ = token.cancelled() => {
                self.cancel_recv(id, op_id);
                rx.await.unwrap_or(Err(MuxError::Closed))
            }
        }
    }

    /// Receive the next frame on fork `id` whatever its size, in a buffer
    /// sized from the frame header. Frames larger than
    /// [`frame::MAX_ADOPTED_FRAME_LEN`](crate::frame::MAX_ADOPTED_FRAME_LEN)
    /// are treated as a protocol violation and close the socket.
    pub async fn recv_any(&self, id: SessionId) -> Result<Vec<u8>, MuxError> {
        let (_op, rx) = self.enqueue_recv(id, Vec::new(), false)?;
        rx.await.unwrap_or(Err(MuxError::Closed))
    }

    /// [`MuxSocket::recv_any`] with caller-controlled cancellation.
    pub async fn recv_any_with(
        &self,
        id: SessionId,
        token: CancellationToken,
    ) -> Result<Vec<u8>, MuxError> {
        let (op_id, mut rx) = self.enqueue_recv(id, Vec::new(), false)?;
        tokio::select! {
            biased;
            res = &mut rx => res.unwrap_or(Err(MuxError::Closed)),
            _ = token.cancelled() => {
                self.cancel_recv(id, op_id);
                rx.await.unwrap_or(Err(MuxError::Closed))
            }
        }
    }

    /// Wait until every op pending at the time of this call has settled:
    /// succeeded, aborted or failed. Ops enqueued afterwards do not delay
    /// it. Completes immediately on an idle socket.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock().unwrap();
            let guard = Arc::new(FlushGuard::new(tx));
            for slot in &mut st.slots {
                for op in &mut slot.send_ops {
                    op.flushes.push(guard.clone());
                }
                for op in &mut slot.recv_ops {
                    op.flushes.push(guard.clone());
                }
            }
        }
        let _ = rx.await;
    }

    /// Close the socket: pending ops fail, future ops fail immediately, the
    /// underlying stream is closed exactly once. Idempotent.
    pub fn close(&self) {
        self.shared.close_with(MuxError::Closed);
    }

    /// Fail the pending ops of one fork and refuse new ones on it; every
    /// other fork keeps running.
    pub fn close_fork(&self, id: SessionId) {
        let mut stops: Vec<CancellationToken> = Vec::new();
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.send_status == Status::Closed && st.recv_status == Status::Closed {
                return;
            }
            let Some(&key) = st.by_session.get(&id) else {
                return;
            };
            st.slots[key].closed = true;

            // An op already on the wire is stopped cooperatively; the
            // writer/reader settles it and keeps the stream framed.
            let send_in_progress = st.slots[key]
                .send_ops
                .front()
                .is_some_and(|op| op.in_progress);
            let recv_in_progress = st.slots[key]
                .recv_ops
                .front()
                .is_some_and(|op| op.in_progress);
            if send_in_progress {
                stops.push(std::mem::replace(&mut st.send_stop, CancellationToken::new()));
            }
            if recv_in_progress {
                stops.push(std::mem::replace(&mut st.recv_stop, CancellationToken::new()));
            }

            let keep = usize::from(send_in_progress);
            while st.slots[key].send_ops.len() > keep {
                let op = st.slots[key].send_ops.remove(keep).expect("length checked");
                op.finish(Err(MuxError::Closed));
                // Drop this op's entry in the global queue; the in-progress
                // op owns the front-most entry for this slot, so drop from
                // the back.
                if let Some(pos) = st.send_queue.iter().rposition(|&k| k == key) {
                    st.send_queue.remove(pos);
                }
            }
            if st.send_queue.is_empty() && st.send_status != Status::Closed {
                st.send_status = Status::Idle;
            }

            let keep = usize::from(recv_in_progress);
            while st.slots[key].recv_ops.len() > keep {
                let op = st.slots[key].recv_ops.remove(keep).expect("length checked");
                st.num_recvs -= 1;
                op.finish(Err(MuxError::Closed));
            }
            if st.num_recvs == 0 && st.recv_status != Status::Closed {
                st.recv_status = Status::Idle;
            }
        }
        for t in stops {
            t.cancel();
        }
    }

    /// Total bytes written to the stream, headers and control blocks
    /// included.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read from the stream, headers and control blocks
    /// included.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// Emit `trace!` events for every protocol step of this socket.
    pub fn enable_logging(&self) {
        self.shared.logging.store(true, Ordering::Relaxed);
    }

    pub fn disable_logging(&self) {
        self.shared.logging.store(false, Ordering::Relaxed);
    }

    fn enqueue_send(
        &self,
        id: SessionId,
        buf: Vec<u8>,
    ) -> Result<(u64, oneshot::Receiver<Result<(), MuxError>>), MuxError> {
        if buf.is_empty() || buf.len() >= u32::MAX as usize {
            return Err(MuxError::InvalidSize);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.send_status == Status::Closed {
                return Err(st.op_error());
            }
            let key = st.slot_for(id)?;
            let op_id = st.next_op_id;
            st.next_op_id += 1;
            st.slots[key].send_ops.push_back(SendOp {
                id: op_id,
                buf,
                done: Some(tx),
                in_progress: false,
                flushes: Vec::new(),
            });
            st.send_queue.push_back(key);
            if st.send_status == Status::Idle {
                st.send_status = Status::InUse;
            }
            self.shared.send_wake.notify_one();
            Ok((op_id, rx))
        }
    }

    fn enqueue_recv(
        &self,
        id: SessionId,
        buf: Vec<u8>,
        exact: bool,
    ) -> Result<(u64, oneshot::Receiver<Result<Vec<u8>, MuxError>>), MuxError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.recv_status == Status::Closed {
                return Err(st.op_error());
            }
            let key = st.slot_for(id)?;
            let op_id = st.next_op_id;
            st.next_op_id += 1;
            st.slots[key].recv_ops.push_back(RecvOp {
                id: op_id,
                buf,
                exact,
                done: Some(tx),
                in_progress: false,
                flushes: Vec::new(),
            });
            st.num_recvs += 1;
            if st.recv_status == Status::Idle {
                st.recv_status = Status::InUse;
            }
            self.shared.recv_wake.notify_one();
            Ok((op_id, rx))
        }
    }

    /// First cancellation tier: a queued op is removed and failed here.
    /// Second tier: an op already on the wire routes a stop through the
    /// socket's send-side stop source, replaced under the lock so the stop
    /// can only hit the transfer it was aimed at.
    fn cancel_send(&self, id: SessionId, op_id: u64) {
        let mut stop = None;
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.send_status == Status::Closed {
                return;
            }
            let Some(&key) = st.by_session.get(&id) else {
                return;
            };
            let Some(pos) = st.slots[key].send_ops.iter().position(|o| o.id == op_id) else {
                return; // already settled
            };
            if st.slots[key].send_ops[pos].in_progress {
                stop = Some(std::mem::replace(&mut st.send_stop, CancellationToken::new()));
            } else {
                let op = st.slots[key].send_ops.remove(pos).expect("position is valid");
                if let Some(qpos) = st.send_queue.iter().position(|&k| k == key) {
                    st.send_queue.remove(qpos);
                }
                op.finish(Err(MuxError::Aborted));
                if st.send_queue.is_empty() {
                    st.send_status = Status::Idle;
                }
            }
        }
        if let Some(t) = stop {
            t.cancel();
        }
    }

    fn cancel_recv(&self, id: SessionId, op_id: u64) {
        let mut stop = None;
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.recv_status == Status::Closed {
                return;
            }
            let Some(&key) = st.by_session.get(&id) else {
                return;
            };
            let Some(pos) = st.slots[key].recv_ops.iter().position(|o| o.id == op_id) else {
                return; // already settled
            };
            if st.slots[key].recv_ops[pos].in_progress {
                stop = Some(std::mem::replace(&mut st.recv_stop, CancellationToken::new()));
            } else {
                let op = st.slots[key].recv_ops.remove(pos).expect("position is valid");
                st.num_recvs -= 1;
                op.finish(Err(MuxError::Aborted));
                if st.num_recvs == 0 {
                    st.recv_status = Status::Idle;
                }
            }
        }
        if let Some(t) = stop {
            t.cancel();
        }
    }
}

impl<S: ByteStream> Drop for MuxSocket<S> {
    fn drop(&mut self) {
        let busy = {
            let st = self.shared.state.lock().unwrap();
            st.send_status == Status::InUse || st.recv_status == Status::InUse
        };
        if busy {
            // Completing here is impossible: the ops hold caller-visible
            // completions and the tasks are mid-transfer.
            eprintln!(
                "muxlink: socket dropped with operations still in flight; \
                 await flush() before dropping"
            );
            std::process::abort();
        }
        self.shared.close_with(MuxError::Closed);
    }
}
