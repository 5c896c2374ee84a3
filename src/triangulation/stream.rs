//! Hand-off of triangulation queries between producer and worker threads.

use super::{Observation, Point3D, StereoTriangulator};
use crate::camera::CameraModelError;
use crate::sync::{QueueMode, WaitCondition};
use log::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Pending {
    queries: VecDeque<Vec<Observation>>,
    closed: bool,
}

/// A closable FIFO of observation sets. Each pushed query is handed to
/// exactly one consumer.
#[derive(Debug)]
pub struct ObservationStream {
    pending: Mutex<Pending>,
    signal: WaitCondition,
}

impl Default for ObservationStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationStream {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            signal: WaitCondition::new(QueueMode::Queue),
        }
    }

    /// Queues one query. Returns `false` if the stream is already closed.
    pub fn push(&self, observations: Vec<Observation>) -> bool {
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return false;
            }
            pending.queries.push_back(observations);
        }
        self.signal.wake_one();
        true
    }

    pub fn len(&self) -> usize {
        self.pending.lock().queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Takes the next query, blocking up to `timeout` (`None` waits forever).
    ///
    /// Returns `None` on timeout, or once the stream is closed and drained.
    pub fn next(&self, timeout: Option<Duration>) -> Option<Vec<Observation>> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            {
                let mut pending = self.pending.lock();
                if let Some(query) = pending.queries.pop_front() {
                    return Some(query);
                }
                if pending.closed {
                    drop(pending);
                    // Pass the close on to any consumer that missed `wake_all`.
                    self.signal.wake_one();
                    return None;
                }
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !self.signal.wait(remaining) {
                trace!("Observation stream wait timed out");
                return None;
            }
        }
    }

    /// Stops accepting queries and releases every blocked consumer. Queries
    /// already queued are still delivered.
    pub fn close(&self) {
        self.pending.lock().closed = true;
        self.signal.wake_all();
        self.signal.wake_one();
    }
}

impl StereoTriangulator {
    /// Consumes queries until `stream` is closed and drained, returning one
    /// result per query in the order they were taken.
    pub fn triangulate_stream(
        &self,
        stream: &ObservationStream,
    ) -> Vec<Result<Point3D, CameraModelError>> {
        let mut results = Vec::new();
        while let Some(query) = stream.next(None) {
            results.push(self.triangulate(&query));
        }
        results
    }
}
