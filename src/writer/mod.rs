//! Outgoing write queues.
//!
//! Each connection owns one [`OutboundQueue`], an ordered FIFO of
//! [`WriteJob`]s. Only the head job is ever drained, so responses reach the
//! socket whole and in enqueue order; a job that the socket will not fully
//! accept stays at the head with its progress recorded. The queue is
//! append-safe from any thread — the reactor drains it, the reaper and
//! notifiers append to it.

use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::Mutex,
};

use bytes::BytesMut;

#[cfg(test)]
mod tests;

/// One framed response waiting to be written to a socket.
#[derive(Debug)]
pub struct WriteJob {
    buffer: BytesMut,
    written: usize,
}

impl WriteJob {
    /// Wrap a fully framed buffer (length prefix already prepended).
    #[must_use]
    pub fn new(buffer: BytesMut) -> Self { Self { buffer, written: 0 } }

    /// Total number of bytes this job will put on the wire.
    #[must_use]
    pub fn total_size(&self) -> usize { self.buffer.len() }

    /// Whether every byte has been written.
    #[must_use]
    pub fn is_done(&self) -> bool { self.written == self.buffer.len() }

    fn unwritten(&self) -> &[u8] { &self.buffer[self.written..] }
}

/// Result of one drain pass over a connection's queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every queued job was written; write interest can be cleared.
    Drained,
    /// The socket would block; jobs remain and write interest must stay set.
    Pending,
}

/// Thread-safe FIFO of pending writes for one connection.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    jobs: Mutex<VecDeque<WriteJob>>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a job at the tail.
    pub fn enqueue(&self, job: WriteJob) {
        self.jobs.lock().expect("writer queue poisoned").push_back(job);
    }

    /// Whether no jobs are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().expect("writer queue poisoned").is_empty()
    }

    /// Write queued jobs to `sink` until it would block or the queue runs
    /// dry. Only the head job makes progress; completed jobs are popped.
    ///
    /// # Errors
    ///
    /// Propagates socket errors, including a socket that accepts zero bytes
    /// for a non-empty job. The caller closes the connection.
    pub fn drain(&self, sink: &mut impl Write) -> io::Result<DrainOutcome> {
        let mut jobs = self.jobs.lock().expect("writer queue poisoned");
        while let Some(head) = jobs.front_mut() {
            while !head.is_done() {
                match sink.write(head.unwritten()) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket accepted no bytes",
                        ));
                    }
                    Ok(n) => head.written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(DrainOutcome::Pending);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            jobs.pop_front();
        }
        Ok(DrainOutcome::Drained)
    }
}
