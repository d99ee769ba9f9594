use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs of [`crate::PtraceExecute`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Longest wait for the tracee to report a stop. `None` blocks forever,
    /// so a tracee that never traps (e.g. no entry marker and an endless
    /// loop) hangs the caller.
    pub step_timeout: Option<Duration>,
    /// How often a pending stop is polled for while `step_timeout` is set.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            step_timeout: None,
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl Config {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}
