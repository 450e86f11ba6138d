//! Interrupt coalescing: per-vector aggregation by count and time.

use std::collections::HashMap;

use flint_core::{Engine, EventId, Tick};
use tracing::trace;

/// Receives the coalescer's output; the machine maps vectors onto its
/// host-visible interrupt mechanism.
pub trait InterruptSink {
    fn post_interrupt(&mut self, iv: u16, set: bool);
}

#[derive(Debug, Clone, Copy)]
struct CoalesceState {
    aggregation_time: Tick,
    aggregation_threshold: u16,
    pending: bool,
    request_count: u16,
    deadline: Tick,
}

pub struct InterruptCoalescer {
    /// Vectors with coalescing enabled.
    vectors: HashMap<u16, CoalesceState>,
    /// Shared timer event; firings carry the vector in their data.
    timer: EventId,
}

impl InterruptCoalescer {
    pub fn new(timer: EventId) -> Self {
        Self {
            vectors: HashMap::new(),
            timer,
        }
    }

    /// Enable coalescing for `iv`. A threshold below 2 would coalesce
    /// nothing and is a configuration error.
    pub fn enable(&mut self, iv: u16, aggregation_time: Tick, aggregation_threshold: u16) {
        assert!(
            aggregation_time > 0 && aggregation_threshold >= 2,
            "invalid interrupt coalescing parameters"
        );

        self.vectors.insert(
            iv,
            CoalesceState {
                aggregation_time,
                aggregation_threshold,
                pending: false,
                request_count: 0,
                deadline: 0,
            },
        );
    }

    pub fn disable<E: Copy>(&mut self, engine: &mut Engine<E>, iv: u16) {
        if self.vectors.remove(&iv).is_some() {
            // Drop a timer still in flight for this vector. The shared
            // timer may also serve other vectors, so only prune if no one
            // else is waiting.
            if self.vectors.values().all(|v| v.deadline == 0) {
                engine.deschedule(self.timer, true);
            }
        }
    }

    pub fn is_enabled(&self, iv: u16) -> bool {
        self.vectors.contains_key(&iv)
    }

    /// Assert (`set`) or deassert an interrupt for `iv`, possibly delaying
    /// delivery to `sink`.
    pub fn post_interrupt<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        sink: &mut impl InterruptSink,
        iv: u16,
        set: bool,
    ) {
        let Some(state) = self.vectors.get_mut(&iv) else {
            sink.post_interrupt(iv, set);
            return;
        };

        if set {
            state.request_count += 1;

            if state.request_count == 1 {
                state.deadline = engine.now() + state.aggregation_time;
                engine.schedule(self.timer, state.deadline, u64::from(iv));

                trace!(iv, deadline = state.deadline, "coalescing window opened");
            } else if state.request_count >= state.aggregation_threshold {
                // Count threshold breached: deliver now, cancel the timer.
                state.request_count = 0;
                state.deadline = 0;
                state.pending = true;

                engine.deschedule(self.timer, false);
                sink.post_interrupt(iv, true);
            }
        } else if state.pending {
            state.pending = false;
            sink.post_interrupt(iv, false);
        }
    }

    /// Serialize every coalesced vector's window state.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_bool, write_u16, write_u64};

        write_u64(w, self.vectors.len() as u64)?;

        let mut vectors: Vec<_> = self.vectors.iter().collect();
        vectors.sort_by_key(|(iv, _)| **iv);

        for (iv, state) in vectors {
            write_u16(w, *iv)?;
            write_u64(w, state.aggregation_time)?;
            write_u16(w, state.aggregation_threshold)?;
            write_bool(w, state.pending)?;
            write_u16(w, state.request_count)?;
            write_u64(w, state.deadline)?;
        }

        Ok(())
    }

    /// Restore window state and re-arm the timer for any open window.
    pub fn restore<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        r: &mut impl std::io::Read,
    ) -> std::io::Result<()> {
        use flint_core::checkpoint::{read_bool, read_u16, read_u64};

        self.vectors.clear();
        engine.deschedule(self.timer, true);

        let count = read_u64(r)?;
        for _ in 0..count {
            let iv = read_u16(r)?;
            let state = CoalesceState {
                aggregation_time: read_u64(r)?,
                aggregation_threshold: read_u16(r)?,
                pending: read_bool(r)?,
                request_count: read_u16(r)?,
                deadline: read_u64(r)?,
            };

            if state.deadline > 0 {
                engine.schedule(self.timer, state.deadline.max(engine.now()), u64::from(iv));
            }

            self.vectors.insert(iv, state);
        }

        Ok(())
    }

    /// Route the timer event here; `data` carries the vector.
    pub fn on_timer(&mut self, sink: &mut impl InterruptSink, data: u64) {
        let iv = data as u16;

        let Some(state) = self.vectors.get_mut(&iv) else {
            // Vector was disabled while the timer was in flight.
            return;
        };

        state.request_count = 0;
        state.deadline = 0;
        state.pending = true;

        trace!(iv, "coalescing window expired");
        sink.post_interrupt(iv, true);
    }
}
