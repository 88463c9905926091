//! The socket's reader task: a header-driven loop that installs slot
//! bindings from meta frames and steers data frames into posted receives.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::MuxError;
use crate::frame::{self, Header};
use crate::stream::ByteStream;

use super::state::Status;
use super::Shared;

pub(crate) async fn reader_task<S: ByteStream>(shared: Arc<Shared<S>>) {
    // Bytes of a frame the peer is still committed to sending after a
    // receive was cancelled mid-read; drained before the next header.
    let mut restore_size: usize = 0;
    // Header and control reads are not tied to any single op, so no op
    // cancellation can stop them.
    let no_stop = CancellationToken::new();

    loop {
        // Park until at least one receive has been requested.
        loop {
            let notified = shared.recv_wake.notified();
            {
                let mut st = shared.state.lock().unwrap();
                if st.recv_status == Status::Closed {
                    return;
                }
                if st.num_recvs > 0 {
                    st.recv_status = Status::InUse;
                    break;
                }
                st.recv_status = Status::Idle;
            }
            notified.await;
        }

        if restore_size > 0 {
            if shared.logging() {
                trace!(bytes = restore_size, "recv: restore");
            }
            let mut scratch = vec![0u8; restore_size];
            let (n, err) = shared.stream.recv(&mut scratch, &no_stop).await;
            shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(e) = err {
                shared.close_with(e);
                return;
            }
            restore_size = 0;
        }

        // Read headers until one names a data frame, installing slot
        // bindings from any meta frames along the way.
        let (size, remote_slot) = loop {
            let mut hdr = [0u8; frame::HEADER_LEN];
            let (n, err) = shared.stream.recv(&mut hdr, &no_stop).await;
            shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(e) = err {
                shared.close_with(e);
                return;
            }
            let header = Header::decode(&hdr);
            if header.is_meta() {
                let mut control = [0u8; frame::CONTROL_LEN];
                let (n, err) = shared.stream.recv(&mut control, &no_stop).await;
                shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                if let Some(e) = err {
                    shared.close_with(e);
                    return;
                }
                let id = frame::decode_new_slot(&control);
                if shared.logging() {
                    trace!(slot = header.slot, %id, "recv: new slot");
                }
                let bound = shared.state.lock().unwrap().bind_remote(header.slot, id);
                if let Err(e) = bound {
                    shared.close_with(e);
                    return;
                }
                continue;
            }
            if shared.logging() {
                trace!(slot = header.slot, bytes = header.size, "recv: header");
            }
            break (header.size as usize, header.slot);
        };

        // Park until the fork this frame belongs to has a posted receive;
        // receives for other forks queue up behind this frame meanwhile.
        let (key, mut buf, stop) = loop {
            let notified = shared.recv_wake.notified();
            {
                let mut st = shared.state.lock().unwrap();
                if st.recv_status == Status::Closed {
                    return;
                }
                match st.by_remote.get(&remote_slot).copied() {
                    None => {
                        // Data for a slot the peer never announced.
                        drop(st);
                        shared.close_with(MuxError::BadHeader);
                        return;
                    }
                    Some(key) if !st.slots[key].recv_ops.is_empty() => {
                        st.recv_status = Status::InUse;
                        let stop = st.recv_stop.clone();
                        let slot = &mut st.slots[key];
                        let op = slot.recv_ops.front_mut().expect("checked non-empty");
                        if op.exact && op.buf.len() != size {
                            let posted = op.buf.len();
                            let op = slot.recv_ops.pop_front().expect("checked non-empty");
                            st.num_recvs -= 1;
                            op.finish(Err(MuxError::SizeMismatch { frame: size, posted }));
                            drop(st);
                            shared.close_with(MuxError::SizeMismatch { frame: size, posted });
                            return;
                        }
                        if !op.exact && size > frame::MAX_ADOPTED_FRAME_LEN {
                            // An open-size receive adopts whatever the
                            // header claims; refuse to allocate for one
                            // this far out of range.
                            let op = slot.recv_ops.pop_front().expect("checked non-empty");
                            st.num_recvs -= 1;
                            op.finish(Err(MuxError::BadHeader));
                            drop(st);
                            shared.close_with(MuxError::BadHeader);
                            return;
                        }
                        op.in_progress = true;
                        if !op.exact {
                            op.buf.resize(size, 0);
                        }
                        let buf = std::mem::take(&mut op.buf);
                        break (key, buf, stop);
                    }
                    Some(_) => {
                        st.recv_status = Status::RequestedRecvOp;
                    }
                }
            }
            notified.await;
        };

        if shared.logging() {
            trace!(bytes = size, "recv: body");
        }
        let (n, err) = shared.stream.recv(&mut buf, &stop).await;
        shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        match err {
            None => settle_head_op(&shared, key, Ok(buf)),
            Some(e) if e.is_aborted() => {
                // The peer cannot un-send the rest of this frame.
                restore_size = size - n;
                settle_head_op(&shared, key, Err(e));
            }
            Some(e) => {
                settle_head_op(&shared, key, Err(e.clone()));
                shared.close_with(e);
                return;
            }
        }
    }
}

fn settle_head_op<S: ByteStream>(shared: &Shared<S>, key: usize, res: Result<Vec<u8>, MuxError>) {
    let mut st = shared.state.lock().unwrap();
    if st.recv_status == Status::Closed {
        return;
    }
    let op = st.slots[key]
        .recv_ops
        .pop_front()
        .expect("in-progress op is still head");
    st.num_recvs -= 1;
    op.finish(res);
    if st.num_recvs == 0 {
        st.recv_status = Status::Idle;
    }
}
