//! Gapless playback scheduling with barge-in
//!
//! Fragments are placed back to back on the output device's clock. The
//! timeline cursor marks where the next buffer may start; a buffer never
//! starts before the clock's current position, so a cursor that fell behind
//! after a pause resolves to "now" instead of the past.
//!
//! Decoding and scheduling are separate steps.
//! [`PlaybackScheduler::enqueue_fragment`] hands back a [`PendingDecode`]
//! that may run anywhere. [`PlaybackScheduler::complete_decode`] takes the
//! result and releases fragments in arrival order, each placed using the
//! cursor and clock at the moment of release.

use crate::audio::{
    decode_fragment, AudioChunk, AudioFormat, AudioOutput, EncodedFragment, HandleId,
    OutputBuffer,
};
use crate::error::DecodeError;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A fragment waiting to be decoded, holding its place in arrival order
#[derive(Debug)]
pub struct PendingDecode {
    seq: u64,
    fragment: EncodedFragment,
    format: AudioFormat,
}

impl PendingDecode {
    /// First phase. Pure, so it can run on a blocking thread.
    pub fn decode(self) -> DecodedFragment {
        DecodedFragment {
            seq: self.seq,
            result: decode_fragment(&self.fragment, self.format),
        }
    }
}

/// Result of a decode, tagged with its arrival position
#[derive(Debug)]
pub struct DecodedFragment {
    pub seq: u64,
    pub result: Result<Option<AudioChunk>, DecodeError>,
}

/// What became of one fragment once its turn came
#[derive(Debug)]
pub struct Released {
    pub seq: u64,
    /// `Ok(None)` for an empty fragment
    pub outcome: Result<Option<Scheduled>, DecodeError>,
}

/// One live output buffer
struct PlaybackHandle {
    start_time: f64,
    duration: f64,
    node: Box<dyn OutputBuffer>,
}

/// Where a chunk landed on the timeline
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scheduled {
    pub id: HandleId,
    pub start_time: f64,
    pub end_time: f64,
}

/// Owns the active playback set and the timeline cursor
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    active: HashMap<HandleId, PlaybackHandle>,
    next_id: HandleId,
    next_seq: u64,
    next_release: u64,
    decoded: BTreeMap<u64, Result<Option<AudioChunk>, DecodeError>>,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: HashMap::new(),
            next_id: 0,
            next_seq: 0,
            next_release: 0,
            decoded: BTreeMap::new(),
        }
    }

    /// Align the cursor with the output clock. Called once the output path
    /// is wired up.
    pub fn reset(&mut self) {
        self.next_start_time = self.output.current_time();
        debug!("Playback timeline reset to {:.3}s", self.next_start_time);
    }

    /// Accept an inbound fragment and reserve its place in line
    ///
    /// The returned decode can finish in any order relative to others;
    /// pass its result to [`complete_decode`](Self::complete_decode).
    pub fn enqueue_fragment(&mut self, fragment: EncodedFragment) -> PendingDecode {
        let seq = self.next_seq;
        self.next_seq += 1;
        PendingDecode {
            seq,
            fragment,
            format: self.output.format(),
        }
    }

    /// Second phase: schedule every decode whose turn has come
    ///
    /// A result that arrives ahead of an earlier fragment waits for it.
    /// Failed and empty decodes still take their turn, so one bad fragment
    /// never holds up the ones behind it and leaves the timeline untouched.
    pub fn complete_decode(&mut self, decoded: DecodedFragment) -> Vec<Released> {
        if decoded.seq < self.next_release || decoded.seq >= self.next_seq {
            debug!("Ignoring decode for unknown fragment {}", decoded.seq);
            return Vec::new();
        }
        self.decoded.insert(decoded.seq, decoded.result);

        let mut released = Vec::new();
        while let Some(result) = self.decoded.remove(&self.next_release) {
            let seq = self.next_release;
            self.next_release += 1;
            let outcome = result.map(|chunk| chunk.and_then(|chunk| self.schedule(chunk)));
            released.push(Released { seq, outcome });
        }

        if !self.decoded.is_empty() {
            trace!(
                "{} decode(s) waiting for fragment {}",
                self.decoded.len(),
                self.next_release
            );
        }
        released
    }

    /// Fragments enqueued but not yet released
    pub fn pending_decodes(&self) -> u64 {
        self.next_seq - self.next_release
    }

    /// Place a decoded chunk right after everything already scheduled
    ///
    /// Empty chunks are ignored.
    pub fn schedule(&mut self, chunk: AudioChunk) -> Option<Scheduled> {
        if chunk.is_empty() {
            return None;
        }

        let now = self.output.current_time();
        let start_time = self.next_start_time.max(now);
        let chunk = Arc::new(chunk);
        let duration = chunk.duration();

        let id = self.next_id;
        self.next_id += 1;

        let mut node = self.output.create_buffer(id, chunk);
        node.start(start_time);
        self.next_start_time = start_time + duration;

        self.active.insert(
            id,
            PlaybackHandle {
                start_time,
                duration,
                node,
            },
        );

        trace!(
            "Scheduled buffer {} at {:.3}s for {:.3}s (clock {:.3}s, {} active)",
            id,
            start_time,
            duration,
            now,
            self.active.len()
        );

        Some(Scheduled {
            id,
            start_time,
            end_time: start_time + duration,
        })
    }

    /// A buffer finished on its own
    ///
    /// Returns false if the handle was already gone, e.g. cancelled by
    /// [`interrupt`](Self::interrupt) before the notification arrived.
    pub fn on_playback_ended(&mut self, id: HandleId) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed && self.active.is_empty() {
            debug!("Playback drained");
        }
        removed
    }

    /// Stop everything immediately and forget the timeline
    ///
    /// Returns the number of buffers that were cut off.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for (id, mut handle) in self.active.drain() {
            trace!(
                "Stopping buffer {} ({:.3}s..{:.3}s)",
                id,
                handle.start_time,
                handle.start_time + handle.duration
            );
            handle.node.stop();
        }

        // Literal zero rather than the clock: the next schedule() resolves
        // its start from max(cursor, now) so this only holds while every
        // schedule goes through that rule.
        self.next_start_time = 0.0;

        debug!("Interrupted playback, stopped {} buffer(s)", stopped);
        stopped
    }

    /// The remote peer is audible
    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}
