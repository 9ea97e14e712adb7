//! Concurrent capture of a child's output.
//!
//! An [`OutputTailer`] drains a stream on its own tokio task and appends every
//! chunk to an [`OutputBuffer`]. The controlling flow reads the buffer through
//! snapshots while the task keeps writing.

use crate::error::{HarnessError, Result};
use futures::StreamExt;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Default)]
struct BufferState {
    bytes: Vec<u8>,
    /// Bumped by every clear, so stale snapshots can be detected
    generation: u64,
}

/// Append-only byte accumulator shared between the tailer and its readers.
///
/// Between two clears the content only grows. Every operation takes the same
/// lock, so a clear can never race with an append in flight.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    state: Arc<Mutex<BufferState>>,
}

/// Bytes observed by one [`OutputBuffer::snapshot`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    bytes: Vec<u8>,
    generation: u64,
}

impl Snapshot {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, chunk: &[u8]) {
        self.lock().bytes.extend_from_slice(chunk);
    }

    /// Returns everything captured since the last clear.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            bytes: state.bytes.clone(),
            generation: state.generation,
        }
    }

    pub fn read(&self) -> Vec<u8> {
        self.snapshot().into_bytes()
    }

    /// Discards everything captured so far.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.bytes.clear();
        state.generation += 1;
    }

    /// Discards exactly the bytes `snapshot` observed.
    ///
    /// Bytes appended after the snapshot was taken stay in the buffer. Returns
    /// false if the buffer was cleared since, in which case nothing is removed.
    pub fn consume(&self, snapshot: &Snapshot) -> bool {
        let mut state = self.lock();
        if state.generation != snapshot.generation {
            return false;
        }
        let observed = snapshot.bytes.len().min(state.bytes.len());
        state.bytes.drain(..observed);
        state.generation += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the tailer's copy loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerExit {
    /// The stream reached end of file, usually because the process died
    Closed,
    /// `stop()` was observed between two reads
    Stopped,
}

/// Drains a stream into an [`OutputBuffer`] on a dedicated task.
///
/// Stopping is cooperative. A read that is already waiting on the stream is
/// not interrupted, so callers kill the process first and then [`join`] with
/// a deadline.
///
/// [`join`]: OutputTailer::join
pub struct OutputTailer {
    name: String,
    buffer: OutputBuffer,
    stop: CancellationToken,
    handle: Option<JoinHandle<Result<TailerExit>>>,
}

impl OutputTailer {
    /// Starts copying `stream` into a fresh buffer.
    ///
    /// `pid` identifies the producing process. It decides whether a read error
    /// means the process is gone (silently ends the loop) or not (the error is
    /// returned from the task and surfaces through [`OutputTailer::join`]).
    pub fn start<R>(name: impl Into<String>, stream: R, pid: Option<Pid>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let buffer = OutputBuffer::new();
        let stop = CancellationToken::new();

        let handle = tokio::spawn(copy_loop(
            name.clone(),
            stream,
            pid,
            buffer.clone(),
            stop.clone(),
        ));

        Self {
            name,
            buffer,
            stop,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a handle to the buffer this tailer writes into.
    pub fn buffer(&self) -> OutputBuffer {
        self.buffer.clone()
    }

    pub fn read(&self) -> Vec<u8> {
        self.buffer.read()
    }

    pub fn clear(&self) {
        self.buffer.clear()
    }

    /// Asks the copy loop to end before its next read.
    pub fn stop(&self) {
        debug!("stopping output tailer for {}", self.name);
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Waits up to `limit` for the copy loop to end.
    ///
    /// Returns `Ok(None)` if the loop is still blocked on a read when the
    /// deadline passes, or if it was already joined.
    pub async fn join(&mut self, limit: Duration) -> Result<Option<TailerExit>> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(None);
        };

        match timeout(limit, handle).await {
            Ok(joined) => {
                self.handle = None;
                let exit = joined??;
                debug!("output tailer for {} ended: {:?}", self.name, exit);
                Ok(Some(exit))
            }
            Err(_) => {
                warn!(
                    "output tailer for {} still blocked on a read after {:?}",
                    self.name, limit
                );
                Ok(None)
            }
        }
    }
}

impl Drop for OutputTailer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn copy_loop<R>(
    name: String,
    stream: R,
    pid: Option<Pid>,
    buffer: OutputBuffer,
    stop: CancellationToken,
) -> Result<TailerExit>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stream, BytesCodec::new());

    loop {
        if stop.is_cancelled() {
            return Ok(TailerExit::Stopped);
        }

        match frames.next().await {
            Some(Ok(chunk)) => {
                trace!("{}: captured {} bytes", name, chunk.len());
                buffer.append(&chunk);
            }
            None => return Ok(TailerExit::Closed),
            Some(Err(e)) => {
                if !pid.map_or(false, process_alive) {
                    debug!("{}: output closed with {}", name, e);
                    return Ok(TailerExit::Closed);
                }
                error!("{}: output read failed while process is alive: {}", name, e);
                return Err(HarnessError::Tailer { name, source: e });
            }
        }
    }
}

fn process_alive(pid: Pid) -> bool {
    // signal 0 only checks for existence
    kill(pid, None).is_ok()
}
