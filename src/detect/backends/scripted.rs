use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Backend that replays scripted detections instead of running a model.
///
/// Used by tests, the `stub://` demo source, and for replaying recorded
/// detections. The script can be swapped at runtime through a `ScriptHandle`.
pub struct ScriptedBackend {
    name: String,
    script: ScriptHandle,
}

/// Shared handle to a scripted backend's output.
#[derive(Clone, Default)]
pub struct ScriptHandle {
    inner: Arc<Mutex<ScriptState>>,
}

#[derive(Default)]
struct ScriptState {
    detections: Vec<RawDetection>,
    fail_next: usize,
    calls: u64,
}

impl ScriptHandle {
    /// Replace the detections returned on every subsequent call.
    pub fn set(&self, detections: Vec<RawDetection>) {
        self.state().detections = detections;
    }

    pub fn clear(&self) {
        self.state().detections.clear();
    }

    /// Make the next `n` calls fail.
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> u64 {
        self.state().calls
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScriptedBackend {
    /// Backend that always returns the same detections.
    pub fn fixed(name: impl Into<String>, detections: Vec<RawDetection>) -> Self {
        let script = ScriptHandle::default();
        script.set(detections);
        Self {
            name: name.into(),
            script,
        }
    }

    /// Backend plus a handle for changing its output while it runs.
    pub fn shared(name: impl Into<String>) -> (Self, ScriptHandle) {
        let script = ScriptHandle::default();
        (
            Self {
                name: name.into(),
                script: script.clone(),
            },
            script,
        )
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, frame: &Frame, recall_threshold: f32) -> Result<Vec<RawDetection>> {
        let mut state = self.script.state();
        state.calls += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(anyhow!("scripted failure on frame {}", frame.seq));
        }
        Ok(state
            .detections
            .iter()
            .filter(|d| d.confidence >= recall_threshold)
            .cloned()
            .collect())
    }
}
