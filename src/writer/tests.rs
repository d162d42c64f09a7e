//! Unit tests for the outbound write queue.

use std::io::{self, Write};

use bytes::BytesMut;

use super::{DrainOutcome, OutboundQueue, WriteJob};

/// Sink accepting a bounded number of bytes per drain pass, then reporting
/// would-block, the way a congested socket does.
struct ThrottledSink {
    accepted: Vec<u8>,
    per_pass: usize,
    taken_this_pass: usize,
}

impl ThrottledSink {
    fn new(per_pass: usize) -> Self {
        Self {
            accepted: Vec::new(),
            per_pass,
            taken_this_pass: 0,
        }
    }

    fn next_pass(&mut self) { self.taken_this_pass = 0; }
}

impl Write for ThrottledSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let allowed = self.per_pass - self.taken_this_pass;
        if allowed == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let take = allowed.min(buf.len());
        self.accepted.extend_from_slice(&buf[..take]);
        self.taken_this_pass += take;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

fn job(bytes: &[u8]) -> WriteJob { WriteJob::new(BytesMut::from(bytes)) }

#[test]
fn large_job_drains_incrementally() {
    let queue = OutboundQueue::new();
    let payload = vec![0xabu8; 64 * 1024];
    queue.enqueue(job(&payload));

    let mut sink = ThrottledSink::new(4 * 1024);
    let mut passes = 0;
    loop {
        passes += 1;
        match queue.drain(&mut sink).expect("sink never fails") {
            DrainOutcome::Drained => break,
            DrainOutcome::Pending => sink.next_pass(),
        }
    }
    assert_eq!(passes, 16);
    assert_eq!(sink.accepted, payload);
    assert!(queue.is_empty());
}

#[test]
fn jobs_never_interleave() {
    let queue = OutboundQueue::new();
    queue.enqueue(job(&[b'a'; 10]));

    let mut sink = ThrottledSink::new(4);
    assert_eq!(
        queue.drain(&mut sink).expect("sink never fails"),
        DrainOutcome::Pending
    );

    // A response enqueued mid-drain lands behind the in-flight job.
    queue.enqueue(job(&[b'b'; 3]));
    loop {
        sink.next_pass();
        if queue.drain(&mut sink).expect("sink never fails") == DrainOutcome::Drained {
            break;
        }
    }
    let mut expected = vec![b'a'; 10];
    expected.extend_from_slice(&[b'b'; 3]);
    assert_eq!(sink.accepted, expected);
}

#[test]
fn empty_queue_reports_drained() {
    let queue = OutboundQueue::new();
    let mut sink = ThrottledSink::new(16);
    assert_eq!(
        queue.drain(&mut sink).expect("sink never fails"),
        DrainOutcome::Drained
    );
    assert!(queue.is_empty());
}

#[test]
fn dead_socket_surfaces_an_error() {
    struct DeadSink;
    impl Write for DeadSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> { Ok(0) }

        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    let queue = OutboundQueue::new();
    queue.enqueue(job(b"stuck"));
    let err = queue.drain(&mut DeadSink).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WriteZero);
}
