//! # Playback Scheduler
//!
//! Places decoded model speech back to back on the output device's timeline
//! and supports barge-in.
//!
//! ## Scheduling rule:
//! ```text
//! start_at = max(cursor, output.current_time())
//! cursor   = start_at + chunk.duration
//! ```
//! Chunks that arrive faster than they play queue up gaplessly; a chunk that
//! arrives after the queue has drained starts "now" instead of in the past.
//!
//! ## Locking:
//! The cursor and the source registry live behind one `Mutex` and are only
//! ever changed together. Decoding happens before the lock is taken, and the
//! lock is never held across an `.await` (nothing in here is async).
//!
//! ## Completion:
//! Every started source carries a callback that removes it from the registry
//! when the device reports it finished. The callback holds a `Weak` reference,
//! so a scheduler that has already been dropped is simply skipped.

use crate::audio::buffer::{PlaybackChunk, SourceId};
use crate::audio::codec;
use crate::audio::device::OutputDevice;
use crate::error::LiveError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

/// Where one chunk landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

/// Point-in-time view of the scheduler, exposed through the control API.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    pub cursor: f64,
    pub active_sources: usize,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub interrupts: u64,
}

#[derive(Default)]
struct ScheduleState {
    cursor: f64,
    registry: HashMap<SourceId, PlaybackChunk>,
    chunks_scheduled: u64,
    chunks_dropped: u64,
    interrupts: u64,
}

fn lock(state: &Mutex<ScheduleState>) -> MutexGuard<'_, ScheduleState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Gapless, interruptible scheduling of inbound audio on one output device.
pub struct PlaybackScheduler {
    output: Arc<dyn OutputDevice>,
    state: Arc<Mutex<ScheduleState>>,
    next_id: AtomicU64,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn OutputDevice>) -> Self {
        Self {
            output,
            state: Arc::new(Mutex::new(ScheduleState::default())),
            next_id: AtomicU64::new(1),
        }
    }

    fn record_drop(&self) {
        lock(&self.state).chunks_dropped += 1;
    }

    /// Decode a base64 chunk and schedule it right after everything already queued.
    ///
    /// ## Errors:
    /// - `Decode` for malformed base64
    /// - `Format` for a bad byte length, or a rate / channel count that does not
    ///   match the output device
    /// - `Device` if the output refuses the source (e.g. already closed)
    ///
    /// A failed chunk leaves the cursor and registry untouched.
    pub fn enqueue(&self, base64: &str, sample_rate: u32, channel_count: u16) -> Result<ScheduledChunk, LiveError> {
        if sample_rate != self.output.sample_rate() || channel_count != self.output.channel_count() {
            self.record_drop();
            return Err(LiveError::Format(format!(
                "chunk is {} Hz / {} channel(s), output is {} Hz / {} channel(s)",
                sample_rate,
                channel_count,
                self.output.sample_rate(),
                self.output.channel_count()
            )));
        }

        let buffer = match codec::decode_chunk(base64, sample_rate, channel_count) {
            Ok(buffer) => Arc::new(buffer),
            Err(e) => {
                self.record_drop();
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let duration = buffer.duration();

        let mut state = lock(&self.state);
        let start_at = state.cursor.max(self.output.current_time());

        let registry: Weak<Mutex<ScheduleState>> = Arc::downgrade(&self.state);
        let on_ended = Box::new(move || {
            if let Some(state) = registry.upgrade() {
                lock(&state).registry.remove(&id);
            }
        });

        if let Err(e) = self.output.start_source(id, buffer.clone(), start_at, on_ended) {
            state.chunks_dropped += 1;
            return Err(e);
        }

        state.registry.insert(id, PlaybackChunk { id, buffer, start_at });
        state.cursor = start_at + duration;
        state.chunks_scheduled += 1;

        debug!(source_id = id, start_at, duration, cursor = state.cursor, "Scheduled playback chunk");
        Ok(ScheduledChunk { id, start_at, duration })
    }

    /// Stop everything scheduled or playing and reset the cursor to zero.
    pub fn interrupt(&self) {
        let stopped = self.clear(true);
        debug!(stopped, "Playback interrupted");
    }

    /// Teardown variant of [`interrupt`](Self::interrupt): same effect, not
    /// counted as a barge-in.
    pub fn stop_all(&self) {
        let stopped = self.clear(false);
        if stopped > 0 {
            debug!(stopped, "Stopped all playback");
        }
    }

    fn clear(&self, count_interrupt: bool) -> usize {
        let mut state = lock(&self.state);
        let stopped = state.registry.len();
        for id in state.registry.keys() {
            self.output.stop_source(*id);
        }
        state.registry.clear();
        state.cursor = 0.0;
        if count_interrupt {
            state.interrupts += 1;
        }
        stopped
    }

    /// Current cursor position in output-clock seconds.
    pub fn cursor(&self) -> f64 {
        lock(&self.state).cursor
    }

    /// Number of sources scheduled or playing.
    pub fn active_sources(&self) -> usize {
        lock(&self.state).registry.len()
    }

    /// Chunks currently held by the registry, ordered by start time.
    pub fn scheduled(&self) -> Vec<PlaybackChunk> {
        let mut chunks: Vec<PlaybackChunk> = lock(&self.state).registry.values().cloned().collect();
        chunks.sort_by(|a, b| a.start_at.total_cmp(&b.start_at));
        chunks
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = lock(&self.state);
        SchedulerSnapshot {
            cursor: state.cursor,
            active_sources: state.registry.len(),
            chunks_scheduled: state.chunks_scheduled,
            chunks_dropped: state.chunks_dropped,
            interrupts: state.interrupts,
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        let remaining = self.active_sources();
        if remaining > 0 {
            warn!(remaining, "Scheduler dropped with sources still registered");
            self.stop_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::{ManualClock, VirtualOutput};

    const RATE: u32 = 24000;

    /// Base64 of `seconds` of mono 16-bit silence at `RATE`.
    fn chunk(seconds: f64) -> String {
        let frames = (seconds * RATE as f64).round() as usize;
        codec::encode_base64(&codec::encode_pcm(&vec![0i16; frames]))
    }

    fn setup() -> (PlaybackScheduler, Arc<VirtualOutput>, ManualClock) {
        let clock = ManualClock::new();
        let output = VirtualOutput::manual(RATE, 1, clock.clone());
        let scheduler = PlaybackScheduler::new(output.clone());
        (scheduler, output, clock)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_chunks_queue_back_to_back() {
        let (scheduler, _, _) = setup();

        let starts: Vec<f64> = [0.5, 0.3, 0.2]
            .iter()
            .map(|d| scheduler.enqueue(&chunk(*d), RATE, 1).unwrap().start_at)
            .collect();

        assert!(approx(starts[0], 0.0));
        assert!(approx(starts[1], 0.5));
        assert!(approx(starts[2], 0.8));
        assert!(approx(scheduler.cursor(), 1.0));
        assert_eq!(scheduler.active_sources(), 3);
    }

    #[test]
    fn test_gapless_for_any_sequence() {
        let (scheduler, _, clock) = setup();
        clock.set(0.05);

        let durations = [0.1, 0.25, 0.01, 0.4, 0.125];
        let scheduled: Vec<ScheduledChunk> = durations
            .iter()
            .map(|d| scheduler.enqueue(&chunk(*d), RATE, 1).unwrap())
            .collect();

        assert!(approx(scheduled[0].start_at, 0.05));
        for pair in scheduled.windows(2) {
            assert!(approx(pair[1].start_at, pair[0].start_at + pair[0].duration));
        }
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let (scheduler, output, clock) = setup();
        scheduler.enqueue(&chunk(0.2), RATE, 1).unwrap();

        clock.set(1.0);
        output.render();
        let late = scheduler.enqueue(&chunk(0.2), RATE, 1).unwrap();
        assert!(approx(late.start_at, 1.0));
    }

    #[test]
    fn test_interrupt_resets_cursor_and_registry() {
        let (scheduler, output, clock) = setup();
        scheduler.enqueue(&chunk(1.0), RATE, 1).unwrap();

        clock.set(0.3);
        output.render();
        scheduler.interrupt();

        assert_eq!(scheduler.active_sources(), 0);
        assert_eq!(output.active_sources(), 0);
        assert_eq!(scheduler.cursor(), 0.0);

        // Scheduled against the reset cursor, not the stale 1.0
        let next = scheduler.enqueue(&chunk(0.4), RATE, 1).unwrap();
        assert!(approx(next.start_at, 0.3));
        assert!(next.start_at < 1.0);
        assert_eq!(scheduler.snapshot().interrupts, 1);
    }

    #[test]
    fn test_interrupt_at_time_zero_schedules_at_zero() {
        let (scheduler, _, _) = setup();
        scheduler.enqueue(&chunk(1.0), RATE, 1).unwrap();
        scheduler.interrupt();
        let next = scheduler.enqueue(&chunk(0.4), RATE, 1).unwrap();
        assert_eq!(next.start_at, 0.0);
    }

    #[test]
    fn test_completion_deregisters_source() {
        let (scheduler, output, clock) = setup();
        scheduler.enqueue(&chunk(0.5), RATE, 1).unwrap();
        scheduler.enqueue(&chunk(0.5), RATE, 1).unwrap();

        clock.set(0.5);
        output.render();
        assert_eq!(scheduler.active_sources(), 1);
        assert!(approx(scheduler.scheduled()[0].start_at, 0.5));

        clock.set(1.0);
        output.render();
        assert_eq!(scheduler.active_sources(), 0);
        // Natural completion leaves the cursor alone
        assert!(approx(scheduler.cursor(), 1.0));
    }

    #[test]
    fn test_bad_chunks_leave_state_untouched() {
        let (scheduler, _, _) = setup();
        scheduler.enqueue(&chunk(0.5), RATE, 1).unwrap();

        assert!(matches!(scheduler.enqueue("%%%", RATE, 1), Err(LiveError::Decode(_))));
        assert!(matches!(scheduler.enqueue("AAAA", RATE, 1), Err(LiveError::Format(_))));
        assert!(matches!(scheduler.enqueue(&chunk(0.1), 16000, 1), Err(LiveError::Format(_))));
        assert!(matches!(scheduler.enqueue(&chunk(0.1), RATE, 2), Err(LiveError::Format(_))));

        let snapshot = scheduler.snapshot();
        assert!(approx(snapshot.cursor, 0.5));
        assert_eq!(snapshot.active_sources, 1);
        assert_eq!(snapshot.chunks_scheduled, 1);
        assert_eq!(snapshot.chunks_dropped, 4);
    }

    #[test]
    fn test_closed_output_rejects_chunk() {
        let (scheduler, output, _) = setup();
        output.close();
        assert!(matches!(scheduler.enqueue(&chunk(0.1), RATE, 1), Err(LiveError::Device(_))));
        assert_eq!(scheduler.cursor(), 0.0);
    }
}
