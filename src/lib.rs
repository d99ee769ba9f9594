//! Executes exactly one machine instruction in a forked, ptraced child and
//! reports whether it faulted, and in which phase: before reaching it, while
//! executing it, or while stepping past it.
//!
//! ```no_run
//! use synthir_step::{arch, Execute, PtraceExecute, Region};
//!
//! let mut region = Region::isolated(arch::page_size())?;
//! region.write(&arch::TRAP);
//! region.write_at(1, &[0x48, 0x31, 0xc0]); // xor rax, rax
//!
//! let mut exec = PtraceExecute::new();
//! let ip = exec.execute_with_steps(region.addr(), 1, 0);
//! let seen = exec.tracee().map(|tracee| region.read_traced(tracee, 8));
//! exec.dispose_execution();
//! region.dispose()?;
//! # let _ = (ip, seen);
//! # Ok::<(), synthir_step::Error>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("single stepping is implemented on top of Linux ptrace only");

pub mod arch;
mod config;
mod error;
mod execute;
mod ptrace_execute;
mod region;

pub use config::Config;
pub use error::Error;
pub use execute::{Execute, ExecuteError, Phase, Stop};
pub use ptrace_execute::{PtraceExecute, Tracee};
pub use region::Region;
