//! Timing and counter events for stage execution.
//!
//! Everything is emitted through `tracing`; the binary decides where it goes.

use std::time::Instant;

/// Wall-clock timer for one stage execution.
pub struct StageTimer {
    stage: String,
    started: Instant,
}

impl StageTimer {
    pub fn start(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// Emit a named event with key/value pairs at TRACE level.
pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::trace_span!("ckdflow", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}
