use thiserror::Error;

/// Failures of the syscalls behind [`crate::Region`].
///
/// Stepping failures are not reported here: faults are [`crate::ExecuteError`]
/// values and a broken tracing relationship is a panic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("mmap failed: {0}")]
    Map(nix::Error),

    #[error("mprotect(PROT_NONE) failed: {0}")]
    Protect(nix::Error),

    #[error("munmap failed: {0}")]
    Unmap(nix::Error),

    #[error("PTRACE_PEEKDATA at {addr:#x} failed: {source}")]
    Peek { addr: u64, source: nix::Error },
}
