use crate::error::{HarnessError, Result};
use crate::output::OutputBuffer;
use memchr::memmem;
use regex::bytes::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default idle time between two evaluations of a condition.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Something a [`Poller`] waits for.
///
/// Conditions are stateless and re-evaluated on every poll.
pub enum ReadinessCondition {
    /// The captured output contains this byte sequence
    Contains(Vec<u8>),
    /// The regex matches at the start of the captured output
    Matches(Regex),
    /// An arbitrary predicate over the captured output
    Predicate(Box<dyn Fn(&[u8]) -> bool + Send + Sync>),
    /// A file exists; the captured output is ignored
    FileExists(PathBuf),
}

impl ReadinessCondition {
    pub fn contains(marker: impl AsRef<[u8]>) -> Self {
        Self::Contains(marker.as_ref().to_vec())
    }

    /// Builds a condition that only matches at the very start of the output.
    pub fn matches(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{pattern})")).map(Self::Matches)
    }

    pub fn predicate(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Box::new(f))
    }

    pub fn file_exists(path: impl Into<PathBuf>) -> Self {
        Self::FileExists(path.into())
    }

    pub fn is_met(&self, output: &[u8]) -> bool {
        match self {
            Self::Contains(marker) => contains(output, marker),
            Self::Matches(regex) => regex.is_match(output),
            Self::Predicate(f) => f(output),
            Self::FileExists(path) => path.exists(),
        }
    }
}

impl fmt::Debug for ReadinessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains(marker) => write!(f, "output containing {:?}", String::from_utf8_lossy(marker)),
            Self::Matches(regex) => write!(f, "output matching /{}/", regex.as_str()),
            Self::Predicate(_) => write!(f, "output predicate"),
            Self::FileExists(path) => write!(f, "file {}", path.display()),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    memmem::find(haystack, needle).is_some()
}

/// Options for a single [`Poller::wait`] call.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Evaluated before the first snapshot is taken
    pub initial: Vec<u8>,
    /// Drop the matched output from the buffer once the condition holds
    pub clear_on_match: bool,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial: Vec::new(),
            clear_on_match: true,
        }
    }

    pub fn initial(mut self, initial: impl Into<Vec<u8>>) -> Self {
        self.initial = initial.into();
        self
    }

    pub fn keep_output(mut self) -> Self {
        self.clear_on_match = false;
        self
    }
}

/// Blocks the controlling flow until a [`ReadinessCondition`] holds.
///
/// Polling rather than notification: the buffer is filled by an independent
/// tailer task, so the arrival of new bytes is not otherwise observable.
#[derive(Debug, Clone)]
pub struct Poller {
    buffer: OutputBuffer,
    interval: Duration,
}

impl Poller {
    pub fn new(buffer: OutputBuffer, interval: Duration) -> Self {
        Self { buffer, interval }
    }

    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until `condition` holds, returning the output it matched.
    ///
    /// Fails with [`HarnessError::Timeout`] once `options.timeout` has elapsed
    /// without a match; the last evaluation happens at most one interval after
    /// the deadline. With `clear_on_match` the matched bytes are removed from
    /// the buffer, so the next wait starts after them. A match on
    /// `options.initial` clears the whole buffer.
    pub async fn wait(&self, condition: &ReadinessCondition, options: WaitOptions) -> Result<Vec<u8>> {
        let start = Instant::now();
        debug!("waiting up to {:?} for {:?}", options.timeout, condition);

        if condition.is_met(&options.initial) {
            if options.clear_on_match {
                self.buffer.clear();
            }
            return Ok(options.initial);
        }

        loop {
            let snapshot = self.buffer.snapshot();
            if condition.is_met(snapshot.bytes()) {
                debug!("{:?} met after {:?}", condition, start.elapsed());
                if options.clear_on_match {
                    self.buffer.consume(&snapshot);
                }
                return Ok(snapshot.into_bytes());
            }

            let elapsed = start.elapsed();
            if elapsed > options.timeout {
                warn!(
                    "gave up on {:?} after {:?}; last output: {:?}",
                    condition,
                    elapsed,
                    tail(snapshot.bytes(), 512)
                );
                return Err(HarnessError::Timeout {
                    what: format!("{condition:?}"),
                    elapsed,
                });
            }

            sleep(self.interval).await;
        }
    }

    pub async fn wait_for(&self, condition: &ReadinessCondition, timeout: Duration) -> Result<Vec<u8>> {
        self.wait(condition, WaitOptions::new(timeout)).await
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
