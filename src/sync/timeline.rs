//! Write stamps and generation instants
//!
//! A pull returns every record with `cursor < modified_at <= generation`.
//! For that to be gap-free and duplicate-free, every write stamped at or
//! before a generation instant must already be committed when the pull
//! selects. The timeline enforces this:
//! - writes take a stamp above every generation handed out so far, and hold
//!   it as in-flight until the write commits or fails
//! - a generation instant never reaches an in-flight stamp
//!
//! Both record stores route all stamping through one timeline per process.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::clock::Clock;

fn tick() -> Duration {
    Duration::microseconds(1)
}

#[derive(Debug, Default)]
struct TimelineState {
    /// Latest stamp or generation instant handed out
    high_water: Option<DateTime<Utc>>,
    last_generation: Option<DateTime<Utc>>,
    /// Stamps of uncommitted writes, with multiplicity
    in_flight: BTreeMap<DateTime<Utc>, usize>,
}

impl TimelineState {
    fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.high_water {
            Some(high_water) => now.max(high_water),
            None => now,
        }
    }

    fn raise(&mut self, instant: DateTime<Utc>) {
        self.high_water = Some(self.horizon(instant));
    }
}

/// Orders write stamps against pull generation instants
pub struct Timeline {
    clock: Arc<dyn Clock>,
    state: Mutex<TimelineState>,
}

impl Timeline {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TimelineState::default()),
        }
    }

    /// Server "now": the clock, but never behind an instant already issued
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().horizon(self.clock.now())
    }

    /// Upper bound for a pull about to select.
    ///
    /// Every write stamped at or before the returned instant has committed.
    pub fn generation_instant(&self) -> DateTime<Utc> {
        let mut state = self.state.lock();
        let horizon = state.horizon(self.clock.now());

        let mut generation = match state.in_flight.keys().next() {
            Some(oldest) => horizon.min(*oldest - tick()),
            None => horizon,
        };
        if let Some(last) = state.last_generation {
            generation = generation.max(last);
        }

        state.last_generation = Some(generation);
        state.raise(generation);
        generation
    }

    /// Stamp a write; `previous` is the record's current `modified_at`.
    ///
    /// Strictly later than `previous` and than every generation instant
    /// issued so far. Hold the returned guard until the write has committed.
    pub fn stamp(&self, previous: Option<DateTime<Utc>>) -> Stamp<'_> {
        let mut state = self.state.lock();

        let mut at = self.clock.now();
        if let Some(last) = state.last_generation {
            at = at.max(last + tick());
        }
        if let Some(previous) = previous {
            at = at.max(previous + tick());
        }

        *state.in_flight.entry(at).or_insert(0) += 1;
        state.raise(at);
        Stamp { timeline: self, at }
    }

    /// Number of writes stamped but not yet released
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.values().sum()
    }

    fn release(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&at) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&at);
            }
        }
    }
}

/// A write's `modified_at`, in flight until dropped
#[must_use]
pub struct Stamp<'a> {
    timeline: &'a Timeline,
    at: DateTime<Utc>,
}

impl Stamp<'_> {
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

impl Drop for Stamp<'_> {
    fn drop(&mut self) {
        self.timeline.release(self.at);
    }
}
