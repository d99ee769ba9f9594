use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// When, relative to the target instruction, an execution went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Before,
    Instruction,
    After,
}

/// What the tracee did instead of reporting the expected trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stop {
    /// Stopped with a signal other than `SIGTRAP` (`SIGSEGV`, `SIGILL`, ...).
    Signal(#[serde(with = "signal_name")] Signal),
    /// Exited on its own with the given status.
    Exited(i32),
    /// Terminated by a signal without stopping first.
    Killed(#[serde(with = "signal_name")] Signal),
    /// No stop was observed before the configured step timeout elapsed.
    TimedOut,
}

/// A fault, classified by the phase it happened in.
///
/// Instruction pointers carried here were read while the tracee was in a
/// known-good trap stop; anything read after the fault is not reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ExecuteError {
    #[error("child faulted before reaching the instruction: {stop:?}")]
    Before { stop: Stop },
    #[error("instruction at {ip:#x} faulted: {stop:?}")]
    Instruction { ip: u64, stop: Stop },
    #[error("child faulted after the instruction (ip {ip:#x}): {stop:?}")]
    After { ip: u64, stop: Stop },
}

impl ExecuteError {
    pub fn phase(&self) -> Phase {
        match *self {
            ExecuteError::Before { .. } => Phase::Before,
            ExecuteError::Instruction { .. } => Phase::Instruction,
            ExecuteError::After { .. } => Phase::After,
        }
    }

    pub fn stop(&self) -> Stop {
        match *self {
            ExecuteError::Before { stop }
            | ExecuteError::Instruction { stop, .. }
            | ExecuteError::After { stop, .. } => stop,
        }
    }

    pub(crate) fn in_phase(phase: Phase, ip: u64, stop: Stop) -> Self {
        match phase {
            Phase::Before => ExecuteError::Before { stop },
            Phase::Instruction => ExecuteError::Instruction { ip, stop },
            Phase::After => ExecuteError::After { ip, stop },
        }
    }
}

/// A backend able to run one instruction of a code region in isolation.
///
/// The intended cycle is:
/// 1. create regions and write the code (see [`crate::Region`]),
/// 2. `execute_with_steps` pointing at one of them,
/// 3. read regions back as needed,
/// 4. `dispose_execution`,
/// 5. dispose regions that are no longer needed, or go back to 1.
pub trait Execute {
    /// Runs `start` in a fresh child. The code at `start` must begin with a
    /// trap instruction; `steps_before` counts it, so the instruction under
    /// test is the `steps_before`-th one. Returns the instruction pointer
    /// read just after the instruction under test.
    fn execute_with_steps(
        &mut self,
        start: u64,
        steps_before: u32,
        steps_after: u32,
    ) -> Result<u64, ExecuteError>;

    /// Kills and reaps the child of the last execution. No-op if there is none.
    fn dispose_execution(&mut self);
}

mod signal_name {
    use nix::sys::signal::Signal;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(signal: &Signal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(signal.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Signal, D::Error> {
        let name = String::deserialize(deserializer)?;
        Signal::from_str(&name).map_err(D::Error::custom)
    }
}
