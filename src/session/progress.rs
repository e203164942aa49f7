//! Progress and log events delivered from a worker to the host shell
//!
//! The worker owns a [`Progress`] reporter; the host either polls the
//! matching [`ProgressQueue`] or registers a callback. Track events arrive
//! in increasing (cylinder, head) order, nothing is delivered for a track
//! after cancellation fires, and `Complete` is delivered exactly once.

use crate::disk::{Track, TrackStatus};
use crate::session::cancel::CancelToken;
use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Every track good
    Success,
    /// Finished, some tracks not good
    Warnings,
    /// Stopped by an error
    Failed,
    /// Stopped by the cancel token
    Cancelled,
}

/// One progress or log event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProgressEvent {
    /// A track finished
    Track {
        /// Cylinder
        cylinder: u8,
        /// Head
        head: u8,
        /// Final status
        status: TrackStatus,
        /// Sectors with good checksums
        good: usize,
        /// Sectors decoded
        total: usize,
    },
    /// A log line for the session log sink
    Log {
        /// Level name
        level: String,
        /// Message text
        message: String,
    },
    /// The operation ended
    Complete {
        /// How it ended
        outcome: Outcome,
        /// Tracks processed
        tracks: usize,
    },
}

/// Host side of a polled progress channel
#[derive(Debug, Clone, Default)]
pub struct ProgressQueue {
    events: Arc<SegQueue<ProgressEvent>>,
}

impl ProgressQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Next pending event
    pub fn poll(&self) -> Option<ProgressEvent> {
        self.events.pop()
    }

    /// Every pending event in delivery order
    pub fn drain(&self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.events.pop()).collect()
    }

    /// Pending event count
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

type Callback = Box<dyn FnMut(&ProgressEvent) + Send>;

/// Worker side reporter
pub struct Progress {
    queue: Option<ProgressQueue>,
    callback: Option<Callback>,
    cancel: CancelToken,
    last: Option<(u8, u8)>,
    tracks: usize,
    completed: bool,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("last", &self.last)
            .field("tracks", &self.tracks)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Progress {
    /// Reporter that only honours the cancel token
    pub fn silent(cancel: CancelToken) -> Self {
        Self {
            queue: None,
            callback: None,
            cancel,
            last: None,
            tracks: 0,
            completed: false,
        }
    }

    /// Reporter feeding a polled queue
    pub fn with_queue(queue: ProgressQueue, cancel: CancelToken) -> Self {
        Self {
            queue: Some(queue),
            ..Self::silent(cancel)
        }
    }

    /// Also call `callback` for each event
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&ProgressEvent) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Token this reporter watches
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn emit(&mut self, event: ProgressEvent) {
        if let Some(cb) = self.callback.as_mut() {
            cb(&event);
        }
        if let Some(queue) = &self.queue {
            queue.events.push(event);
        }
    }

    /// Report a finished track; ignored after cancellation, after
    /// completion, or when it would go backwards
    pub fn track(&mut self, track: &Track) {
        let key = (track.cylinder, track.head);
        if self.completed || self.cancel.is_cancelled() || self.last.is_some_and(|last| key <= last) {
            return;
        }
        self.last = Some(key);
        self.tracks += 1;
        self.emit(ProgressEvent::Track {
            cylinder: track.cylinder,
            head: track.head,
            status: track.status,
            good: track.good_sectors(),
            total: track.sector_count(),
        });
    }

    /// Forward a log line to the facade and the sink
    pub fn log(&mut self, level: log::Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{}", message);
        if !self.completed {
            self.emit(ProgressEvent::Log {
                level: level.to_string(),
                message,
            });
        }
    }

    /// Deliver the final event; later calls do nothing
    pub fn complete(&mut self, outcome: Outcome) {
        if self.completed {
            return;
        }
        self.completed = true;
        let tracks = self.tracks;
        self.emit(ProgressEvent::Complete { outcome, tracks });
    }

    /// Whether `complete` has been delivered
    pub fn is_complete(&self) -> bool {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn track(c: u8, h: u8) -> Track {
        let mut t = Track::new(c, h);
        t.status = TrackStatus::Ok;
        t
    }

    #[test]
    fn test_monotonic_and_single_complete() {
        let queue = ProgressQueue::new();
        let mut p = Progress::with_queue(queue.clone(), CancelToken::new());
        p.track(&track(0, 0));
        p.track(&track(0, 1));
        p.track(&track(0, 0));
        p.complete(Outcome::Success);
        p.complete(Outcome::Failed);
        p.track(&track(1, 0));
        let events = queue.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            ProgressEvent::Complete {
                outcome: Outcome::Success,
                tracks: 2
            }
        );
    }

    #[test]
    fn test_nothing_after_cancel() {
        let cancel = CancelToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut p = Progress::silent(cancel.clone()).with_callback(move |e| sink.lock().push(e.clone()));
        p.track(&track(0, 0));
        cancel.cancel();
        p.track(&track(1, 0));
        p.complete(Outcome::Cancelled);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[1], ProgressEvent::Complete { outcome: Outcome::Cancelled, .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&ProgressEvent::Complete {
            outcome: Outcome::Warnings,
            tracks: 3,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"complete","outcome":"warnings","tracks":3}"#);
    }
}
