//! Counters and thresholds that, when mutated, emit structured events
//! through the event fabric (spec §4.5). Realised as explicit `add`/`set`
//! methods rather than attribute descriptors that intercept arithmetic
//! (spec §9 Design Notes).

use crate::fabric::EventEmitter;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

fn vital_event(emitter: &EventEmitter, name: &str, description: &str, kind: &str, rest: Vec<String>) {
    use crate::fabric::EventRecord;
    use chrono::Utc;
    emitter.emit(EventRecord {
        event_type: "VITAL".to_string(),
        name: name.to_string(),
        timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
        user: String::new(),
        application: String::new(),
        payload: {
            let mut p = vec![kind.to_string(), description.to_string()];
            p.extend(rest);
            p
        },
    })
}

/// `{name, description, value}` (spec §4.5). `add`/`set` emit a `VITAL`
/// event with payload `{kind="ERROR", description, value, delta}`, where
/// `delta = new - old`; no event fires when `delta == 0`.
pub struct VitalCounter {
    name: String,
    description: String,
    value: AtomicI64,
    emitter: Mutex<Option<EventEmitter>>,
}

impl VitalCounter {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            value: AtomicI64::new(0),
            emitter: Mutex::new(None),
        }
    }

    /// Wires this counter to a fabric publisher; counters constructed
    /// before a publisher exists (e.g. the process-wide `invalid_input`
    /// counter in [`crate::env::Env`]) can be attached once one becomes
    /// available.
    pub fn attach(&self, emitter: EventEmitter) {
        *self.emitter.lock().unwrap() = Some(emitter);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, new_value: i64) {
        let old = self.value.swap(new_value, Ordering::Relaxed);
        self.emit_delta(old, new_value);
    }

    pub fn add(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let old = self.value.fetch_add(delta, Ordering::Relaxed);
        self.emit_delta(old, old + delta);
    }

    fn emit_delta(&self, old: i64, new: i64) {
        let delta = new - old;
        if delta == 0 {
            return;
        }
        if let Some(emitter) = self.emitter.lock().unwrap().as_ref() {
            vital_event(
                emitter,
                &self.name,
                &self.description,
                "ERROR",
                vec![new.to_string(), delta.to_string()],
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Above,
    Below,
}

/// `{name, description, input_range, threshold_kind, threshold_value}`
/// (spec §4.5). Inputs outside `input_range` bump the shared `invalid_input`
/// counter instead of being evaluated; the boundary value itself never
/// counts as a crossing.
pub struct VitalThreshold {
    name: String,
    description: String,
    input_range: RangeInclusive<f64>,
    kind: ThresholdKind,
    threshold_value: f64,
    emitter: Mutex<Option<EventEmitter>>,
    invalid_input: std::sync::Arc<VitalCounter>,
}

impl VitalThreshold {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_range: RangeInclusive<f64>,
        kind: ThresholdKind,
        threshold_value: f64,
        invalid_input: std::sync::Arc<VitalCounter>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_range,
            kind,
            threshold_value,
            emitter: Mutex::new(None),
            invalid_input,
        }
    }

    pub fn attach(&self, emitter: EventEmitter) {
        *self.emitter.lock().unwrap() = Some(emitter);
    }

    /// Feeds one sample. Returns `true` if it crossed the threshold and an
    /// event was emitted, `false` if it was rejected or stayed on the safe
    /// side.
    pub fn observe(&self, value: f64) -> bool {
        if !self.input_range.contains(&value) {
            self.invalid_input.add(1);
            return false;
        }

        let crossed = match self.kind {
            ThresholdKind::Above => value > self.threshold_value,
            ThresholdKind::Below => value < self.threshold_value,
        };
        if !crossed {
            return false;
        }

        if let Some(emitter) = self.emitter.lock().unwrap().as_ref() {
            vital_event(
                emitter,
                &self.name,
                &self.description,
                "THRESHOLD",
                vec![value.to_string(), self.threshold_value.to_string()],
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn emitter_pair() -> (EventEmitter, mpsc::UnboundedReceiver<crate::fabric::EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventEmitter::from_sender(tx), rx)
    }

    #[test]
    fn counter_emits_through_attached_fabric() {
        let (emitter, mut rx) = emitter_pair();
        let counter = VitalCounter::new("errors", "error count");
        counter.attach(emitter);
        counter.add(3);
        let record = rx.try_recv().unwrap();
        assert_eq!(record.event_type, "VITAL");
        assert_eq!(record.payload[0], "ERROR");
        assert_eq!(record.payload[1], "error count");
    }

    #[test]
    fn counter_no_event_on_zero_delta() {
        let counter = VitalCounter::new("errors", "error count");
        counter.add(0);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn counter_tracks_value() {
        let counter = VitalCounter::new("errors", "error count");
        counter.add(3);
        counter.add(-1);
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn threshold_rejects_out_of_range() {
        let invalid = Arc::new(VitalCounter::new("invalid_input", "rejected input"));
        let threshold = VitalThreshold::new(
            "latency",
            "latency threshold",
            0.0..=1000.0,
            ThresholdKind::Above,
            500.0,
            invalid.clone(),
        );
        assert!(!threshold.observe(-1.0));
        assert_eq!(invalid.value(), 1);
    }

    #[test]
    fn threshold_boundary_is_not_a_crossing() {
        let invalid = Arc::new(VitalCounter::new("invalid_input", "rejected input"));
        let threshold = VitalThreshold::new(
            "latency",
            "latency threshold",
            0.0..=1000.0,
            ThresholdKind::Above,
            500.0,
            invalid,
        );
        assert!(!threshold.observe(500.0));
        assert!(threshold.observe(500.1));
    }
}
