//! Scenario tests driving two sockets over an in-memory pipe.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;
use crate::session::SessionId;
use crate::stream::{duplex, ByteStream, PipeStream};

use super::MuxSocket;

fn pair(capacity: usize) -> (MuxSocket<PipeStream>, MuxSocket<PipeStream>, SessionId) {
    let root = SessionId::root("test");
    let (a, b) = duplex(capacity);
    (MuxSocket::new(a, root), MuxSocket::new(b, root), root)
}

#[tokio::test]
async fn test_wire_format_of_first_sends() {
    let root = SessionId::root("wire");
    let (a, raw) = duplex(1 << 16);
    let sock = MuxSocket::new(a, root);

    sock.send(root, vec![0x01]).await.unwrap();
    sock.send(root, vec![0x02, 0x03]).await.unwrap();

    // one NewSlot announcement for slot 1, then the two data frames
    let mut expected = Vec::new();
    expected.extend_from_slice(&[0, 0, 0, 0, 1, 0, 0, 0]);
    expected.extend_from_slice(root.as_bytes());
    expected.extend_from_slice(&[1, 0, 0, 0, 1, 0, 0, 0, 0x01]);
    expected.extend_from_slice(&[2, 0, 0, 0, 1, 0, 0, 0, 0x02, 0x03]);

    let mut got = vec![0u8; expected.len()];
    let none = CancellationToken::new();
    let (n, err) = raw.recv(&mut got, &none).await;
    assert_eq!(n, expected.len());
    assert!(err.is_none());
    assert_eq!(got, expected);
    assert_eq!(sock.bytes_sent(), expected.len() as u64);
}

#[tokio::test]
async fn test_fork_order_delivery() {
    let (alice, bob, root) = pair(4096);
    let fa = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();
    assert_eq!(fa, fb, "peers derive the same fork id independently");

    alice.send(fa, vec![0x01]).await.unwrap();
    alice.send(fa, vec![0x02, 0x03]).await.unwrap();

    let first = bob.recv(fb, vec![0; 1]).await.unwrap();
    let second = bob.recv(fb, vec![0; 2]).await.unwrap();
    assert_eq!(first, vec![0x01]);
    assert_eq!(second, vec![0x02, 0x03]);
}

#[tokio::test]
async fn test_recv_posted_before_send_arrives() {
    let (alice, bob, root) = pair(4096);
    let fa = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    let (got, sent) = tokio::join!(bob.recv(fb, vec![0; 1]), async {
        sleep(Duration::from_millis(20)).await;
        alice.send(fa, vec![9]).await
    });
    sent.unwrap();
    assert_eq!(got.unwrap(), vec![9]);
}

#[tokio::test]
async fn test_interleaved_forks() {
    let (alice, bob, root) = pair(4096);
    let f1 = alice.fork(root).unwrap();
    let f2 = alice.fork(root).unwrap();
    let b1 = bob.fork(root).unwrap();
    let b2 = bob.fork(root).unwrap();
    assert_eq!((f1, f2), (b1, b2));

    alice.send(f1, vec![0xAA]).await.unwrap();
    alice.send(f2, vec![0xBB]).await.unwrap();

    // f1's frame is first on the wire, so bob's reader holds its header
    // until the f1 receive shows up; the f2 receive completes after it.
    let bob = std::sync::Arc::new(bob);
    let r2 = tokio::spawn({
        let bob = bob.clone();
        async move { bob.recv(b2, vec![0; 1]).await }
    });
    sleep(Duration::from_millis(50)).await;
    assert!(
        !r2.is_finished(),
        "f2 receive cannot complete while f1's frame is undelivered"
    );

    assert_eq!(bob.recv(b1, vec![0; 1]).await.unwrap(), vec![0xAA]);
    assert_eq!(r2.await.unwrap().unwrap(), vec![0xBB]);
}

#[tokio::test]
async fn test_fork_isolation() {
    let (alice, bob, root) = pair(4096);
    let f1 = alice.fork(root).unwrap();
    let f2 = alice.fork(root).unwrap();
    let b1 = bob.fork(root).unwrap();
    let b2 = bob.fork(root).unwrap();

    alice.send(f2, vec![2]).await.unwrap();
    alice.send(f1, vec![1]).await.unwrap();

    let (g1, g2) = tokio::join!(bob.recv(b1, vec![0; 1]), bob.recv(b2, vec![0; 1]));
    assert_eq!(g1.unwrap(), vec![1]);
    assert_eq!(g2.unwrap(), vec![2]);
}

#[tokio::test]
async fn test_cancel_before_start() {
    // A pipe small enough that the first send stalls with bob not reading.
    let (alice, bob, root) = pair(16);
    let f = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    let token = CancellationToken::new();
    let (r1, r2, got) = tokio::join!(
        alice.send(f, vec![0x11; 64]),
        async {
            sleep(Duration::from_millis(20)).await;
            let send = alice.send_with(f, vec![0x22; 8], token.clone());
            let (r, ()) = tokio::join!(send, async {
                sleep(Duration::from_millis(20)).await;
                token.cancel();
            });
            r
        },
        async {
            // let the cancel land while the second send is still queued
            sleep(Duration::from_millis(100)).await;
            bob.recv(fb, vec![0; 64]).await
        }
    );

    r1.unwrap();
    assert!(r2.unwrap_err().is_aborted());
    assert_eq!(got.unwrap(), vec![0x11; 64]);

    // only the first frame ever hit the wire
    alice.flush().await;
    assert_eq!(alice.bytes_sent(), (24 + 8 + 64) as u64);
}

#[tokio::test]
async fn test_cancel_mid_write_preserves_framing() {
    // Capacity 32 holds exactly the NewSlot block plus the data header, so
    // the payload write blocks with zero bytes moved.
    let (alice, bob, root) = pair(32);
    let f = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    let big: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    let token = CancellationToken::new();

    let (r1, ()) = tokio::join!(alice.send_with(f, big.clone(), token.clone()), async {
        sleep(Duration::from_millis(30)).await;
        token.cancel();
    });
    assert!(r1.unwrap_err().is_aborted());

    // The next send drains the remainder of the cancelled frame before its
    // own, so the peer still observes two whole frames in order.
    let (r2, got1) = tokio::join!(alice.send(f, vec![0xEE; 4]), bob.recv(fb, vec![0; 200]));
    r2.unwrap();
    assert_eq!(got1.unwrap(), big);

    let got2 = bob.recv(fb, vec![0; 4]).await.unwrap();
    assert_eq!(got2, vec![0xEE; 4]);

    alice.flush().await;
    assert_eq!(alice.bytes_sent(), (24 + 8 + 200 + 8 + 4) as u64);
}

#[tokio::test]
async fn test_cancel_during_restore_drain_keeps_announcement() {
    let (alice, bob, root) = pair(32);
    let f = alice.fork(root).unwrap();
    let g = alice.fork(root).unwrap();
    let bf = bob.fork(root).unwrap();
    let bg = bob.fork(root).unwrap();

    let big: Vec<u8> = (0..200u32).map(|i| i as u8).collect();

    // Cancel f's first send mid-frame; its remainder becomes restore bytes.
    let t1 = CancellationToken::new();
    let (r1, ()) = tokio::join!(alice.send_with(f, big.clone(), t1.clone()), async {
        sleep(Duration::from_millis(30)).await;
        t1.cancel();
    });
    assert!(r1.unwrap_err().is_aborted());

    // g's first send stalls in the restore drain (the pipe is still full)
    // and is cancelled there; g's NewSlot announcement must not be lost
    // with it.
    let t2 = CancellationToken::new();
    let (r2, ()) = tokio::join!(alice.send_with(g, vec![0x77; 4], t2.clone()), async {
        sleep(Duration::from_millis(30)).await;
        t2.cancel();
    });
    assert!(r2.unwrap_err().is_aborted());

    // bob drains f's frame; g's retried send still announces g first.
    let (r3, got_f, got_g) = tokio::join!(
        alice.send(g, vec![0x88; 4]),
        bob.recv(bf, vec![0; 200]),
        bob.recv(bg, vec![0; 4]),
    );
    r3.unwrap();
    assert_eq!(got_f.unwrap(), big);
    assert_eq!(got_g.unwrap(), vec![0x88; 4]);
}

#[tokio::test]
async fn test_recv_any_rejects_oversized_frame() {
    let root = SessionId::root("cap");
    let (raw, b) = duplex(4096);
    let bob = MuxSocket::new(b, root);
    let none = CancellationToken::new();

    // Announce slot 7, then claim a frame of ~4 GiB. The open-size receive
    // must refuse it instead of allocating.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0, 0, 0, 0, 7, 0, 0, 0]);
    bytes.extend_from_slice(root.as_bytes());
    bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 7, 0, 0, 0]);
    let (_, err) = raw.send(&bytes, &none).await;
    assert!(err.is_none());

    assert!(matches!(
        bob.recv_any(root).await.unwrap_err(),
        MuxError::BadHeader
    ));
}

#[tokio::test]
async fn test_cancel_recv_mid_read_drains_frame() {
    let root = SessionId::root("restore");
    let (raw, b) = duplex(4096);
    let bob = MuxSocket::new(b, root);
    let none = CancellationToken::new();

    // Hand-rolled peer: announce slot 7 for the root fork, then promise a
    // 64-byte frame but deliver only 10 bytes of it.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0, 0, 0, 0, 7, 0, 0, 0]);
    bytes.extend_from_slice(root.as_bytes());
    bytes.extend_from_slice(&[64, 0, 0, 0, 7, 0, 0, 0]);
    bytes.extend_from_slice(&[0xCC; 10]);
    let (_, err) = raw.send(&bytes, &none).await;
    assert!(err.is_none());

    let token = CancellationToken::new();
    let (r, ()) = tokio::join!(bob.recv_with(root, vec![0; 64], token.clone()), async {
        sleep(Duration::from_millis(30)).await;
        token.cancel();
    });
    assert!(r.unwrap_err().is_aborted());

    // The peer is still committed to the rest of the frame. Deliver it plus
    // a second frame; the fresh receive must see only the second one.
    let mut rest = vec![0xCC; 54];
    rest.extend_from_slice(&[3, 0, 0, 0, 7, 0, 0, 0]);
    rest.extend_from_slice(&[1, 2, 3]);
    let (_, err) = raw.send(&rest, &none).await;
    assert!(err.is_none());

    let got = bob.recv(root, vec![0; 3]).await.unwrap();
    assert_eq!(got, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_flush_settles_posted_sends() {
    let root = SessionId::root("flush");
    let (a, raw) = duplex(1 << 20);
    let sock = MuxSocket::new(a, root);

    for i in 0..100u32 {
        sock.post(root, vec![i as u8; 16]).unwrap();
    }
    sock.flush().await;
    assert_eq!(sock.bytes_sent(), (24 + 100 * (8 + 16)) as u64);
    drop(raw);
}

#[tokio::test]
async fn test_flush_on_idle_socket_completes_immediately() {
    let (alice, _bob, _root) = pair(64);
    alice.flush().await;
}

#[tokio::test]
async fn test_flush_waits_for_settlement_not_success() {
    let (alice, _bob, root) = pair(64);
    let f = alice.fork(root).unwrap();

    let token = CancellationToken::new();
    let (r, tag, ()) = tokio::join!(
        alice.recv_with(f, vec![0; 8], token.clone()),
        async {
            sleep(Duration::from_millis(10)).await;
            alice.flush().await;
            "flushed"
        },
        async {
            sleep(Duration::from_millis(50)).await;
            token.cancel();
        }
    );
    assert!(r.unwrap_err().is_aborted());
    assert_eq!(tag, "flushed");
}

#[tokio::test]
async fn test_recv_any_adopts_frame_size() {
    let (alice, bob, root) = pair(4096);
    let f = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    alice.send(f, vec![7, 8, 9]).await.unwrap();
    let got = bob.recv_any(fb).await.unwrap();
    assert_eq!(got, vec![7, 8, 9]);
}

#[tokio::test]
async fn test_size_mismatch_is_fatal() {
    let (alice, bob, root) = pair(4096);
    let f = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    alice.send(f, vec![1, 2, 3]).await.unwrap();
    match bob.recv(fb, vec![0; 2]).await.unwrap_err() {
        MuxError::SizeMismatch { frame, posted } => assert_eq!((frame, posted), (3, 2)),
        e => panic!("expected size mismatch, got {e}"),
    }

    // the violation closed bob's socket, and the recorded error is reused
    assert!(matches!(
        bob.recv(fb, vec![0; 3]).await.unwrap_err(),
        MuxError::SizeMismatch { .. }
    ));
}

#[tokio::test]
async fn test_close_fails_pending_and_future_ops() {
    let (alice, _bob, root) = pair(64);
    let f = alice.fork(root).unwrap();

    let (r, ()) = tokio::join!(alice.recv(f, vec![0; 4]), async {
        sleep(Duration::from_millis(20)).await;
        alice.close();
    });
    assert!(r.unwrap_err().is_closed());

    assert!(alice.send(f, vec![1]).await.unwrap_err().is_closed());
    assert!(alice.post(f, vec![1]).unwrap_err().is_closed());
    assert!(alice.fork(root).unwrap_err().is_closed());
}

#[tokio::test]
async fn test_close_fork_leaves_other_forks_running() {
    let (alice, bob, root) = pair(4096);
    let f2 = {
        let _f1 = alice.fork(root).unwrap();
        alice.fork(root).unwrap()
    };
    let b1 = bob.fork(root).unwrap();
    let b2 = bob.fork(root).unwrap();

    let (dead, ()) = tokio::join!(bob.recv(b1, vec![0; 1]), async {
        sleep(Duration::from_millis(20)).await;
        bob.close_fork(b1);
    });
    assert!(dead.unwrap_err().is_closed());
    assert!(bob.recv(b1, vec![0; 1]).await.unwrap_err().is_closed());

    // the rest of the socket is unaffected
    alice.send(f2, vec![0x55]).await.unwrap();
    assert_eq!(bob.recv(b2, vec![0; 1]).await.unwrap(), vec![0x55]);
}

#[tokio::test]
async fn test_empty_send_is_rejected() {
    let (alice, _bob, root) = pair(64);
    let f = alice.fork(root).unwrap();
    assert!(matches!(
        alice.send(f, Vec::new()).await.unwrap_err(),
        MuxError::InvalidSize
    ));
}

#[tokio::test]
async fn test_bidirectional_traffic() {
    let (alice, bob, root) = pair(4096);
    let fa = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    let (sa, sb, ra, rb) = tokio::join!(
        alice.send(fa, vec![0xA1, 0xA2]),
        bob.send(fb, vec![0xB1]),
        alice.recv(fa, vec![0; 1]),
        bob.recv(fb, vec![0; 2]),
    );
    sa.unwrap();
    sb.unwrap();
    assert_eq!(ra.unwrap(), vec![0xB1]);
    assert_eq!(rb.unwrap(), vec![0xA1, 0xA2]);

    // each side saw the other's announcement, header and payload
    assert_eq!(alice.bytes_sent(), (24 + 8 + 2) as u64);
    assert_eq!(bob.bytes_received(), (24 + 8 + 2) as u64);
}

#[tokio::test]
async fn test_many_messages_per_fork_keep_order() {
    let (alice, bob, root) = pair(256);
    let fa = alice.fork(root).unwrap();
    let fb = bob.fork(root).unwrap();

    let (send, recv) = tokio::join!(
        async {
            for i in 0..50u8 {
                alice.send(fa, vec![i; 4]).await?;
            }
            Ok::<_, MuxError>(())
        },
        async {
            for i in 0..50u8 {
                let got = bob.recv(fb, vec![0; 4]).await?;
                assert_eq!(got, vec![i; 4]);
            }
            Ok::<_, MuxError>(())
        }
    );
    send.unwrap();
    recv.unwrap();
}
