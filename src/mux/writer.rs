//! The socket's writer task: one long-running loop that drains the global
//! send queue, announcing slots to the peer before their first frame.

use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::error::MuxError;
use crate::frame::{self, Header};
use crate::stream::ByteStream;

use super::state::Status;
use super::Shared;

pub(crate) async fn writer_task<S: ByteStream>(shared: Arc<Shared<S>>) {
    // Unsent remainder of a frame whose op was cancelled mid-write. The
    // peer expects the whole frame, so these bytes go out before any new
    // frame does.
    let mut restore: Vec<u8> = Vec::new();

    'ops: loop {
        // Park until an op reaches the head of the queue, or the socket
        // closes.
        let (key, meta, header, payload, stop) = loop {
            let notified = shared.send_wake.notified();
            {
                let mut st = shared.state.lock().unwrap();
                if st.send_status == Status::Closed {
                    return;
                }
                if let Some(&key) = st.send_queue.front() {
                    st.send_status = Status::InUse;
                    let stop = st.send_stop.clone();
                    let slot = &mut st.slots[key];
                    let op = slot
                        .send_ops
                        .front_mut()
                        .expect("queued slot has a head op");
                    op.in_progress = true;
                    let payload = std::mem::take(&mut op.buf);
                    let meta = if slot.initiated {
                        None
                    } else {
                        slot.initiated = true;
                        Some(frame::encode_new_slot(slot.local_id, &slot.session))
                    };
                    let header = Header {
                        size: payload.len() as u32,
                        slot: slot.local_id,
                    }
                    .encode();
                    break (key, meta, header, payload, stop);
                }
                st.send_status = Status::Idle;
            }
            notified.await;
        };

        if shared.logging() {
            trace!(bytes = payload.len(), "send: next op");
        }

        // Finish the frame a cancelled op left half-written.
        if !restore.is_empty() {
            if shared.logging() {
                trace!(bytes = restore.len(), "send: restore");
            }
            let (n, err) = shared.stream.send(&restore, &stop).await;
            shared.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(e) = err {
                restore.drain(..n);
                if e.is_aborted() && meta.is_some() {
                    // This op's announcement never went out; put the slot
                    // back so the fork's next send still leads with it.
                    let mut st = shared.state.lock().unwrap();
                    if st.send_status != Status::Closed {
                        st.slots[key].initiated = false;
                    }
                }
                if fail_head_op(&shared, key, e).is_break() {
                    return;
                }
                continue 'ops;
            }
            restore.clear();
        }

        // Announce the slot binding before its first frame.
        if let Some(meta) = meta {
            if shared.logging() {
                trace!("send: new slot");
            }
            let (n, err) = shared.stream.send(&meta, &stop).await;
            shared.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(e) = err {
                if e.is_aborted() {
                    if n > 0 {
                        restore.extend_from_slice(&meta[n..]);
                    } else {
                        // Nothing hit the wire; the announcement still has
                        // to precede the fork's first frame.
                        let mut st = shared.state.lock().unwrap();
                        if st.send_status != Status::Closed {
                            st.slots[key].initiated = false;
                        }
                    }
                }
                if fail_head_op(&shared, key, e).is_break() {
                    return;
                }
                continue 'ops;
            }
        }

        if shared.logging() {
            trace!("send: header");
        }
        let (n, err) = shared.stream.send(&header, &stop).await;
        shared.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(e) = err {
            if e.is_aborted() && n > 0 {
                restore.extend_from_slice(&header[n..]);
                restore.extend_from_slice(&payload);
            }
            if fail_head_op(&shared, key, e).is_break() {
                return;
            }
            continue 'ops;
        }

        if shared.logging() {
            trace!("send: body");
        }
        let (n, err) = shared.stream.send(&payload, &stop).await;
        shared.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(e) = err {
            if e.is_aborted() {
                // The header already promised these bytes to the peer.
                restore.extend_from_slice(&payload[n..]);
            }
            if fail_head_op(&shared, key, e).is_break() {
                return;
            }
            continue 'ops;
        }

        finish_head_op(&shared, key);
    }
}

fn finish_head_op<S: ByteStream>(shared: &Shared<S>, key: usize) {
    let mut st = shared.state.lock().unwrap();
    if st.send_status == Status::Closed {
        return;
    }
    st.send_queue.pop_front();
    let op = st.slots[key]
        .send_ops
        .pop_front()
        .expect("in-progress op is still head");
    op.finish(Ok(()));
    if st.send_queue.is_empty() {
        st.send_status = Status::Idle;
    }
}

/// Settle the head op with `e`. Aborts keep the socket running; anything
/// else closes it and ends the task (`Break`).
fn fail_head_op<S: ByteStream>(shared: &Arc<Shared<S>>, key: usize, e: MuxError) -> ControlFlow<()> {
    if e.is_aborted() {
        let mut st = shared.state.lock().unwrap();
        if st.send_status == Status::Closed {
            return ControlFlow::Break(());
        }
        st.send_queue.pop_front();
        let op = st.slots[key]
            .send_ops
            .pop_front()
            .expect("in-progress op is still head");
        op.finish(Err(e));
        if st.send_queue.is_empty() {
            st.send_status = Status::Idle;
        }
        return ControlFlow::Continue(());
    }
    shared.close_with(e);
    ControlFlow::Break(())
}
