use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use log::{debug, log_enabled, trace, warn, Level};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::arch::Registers;
use crate::config::Config;
use crate::error::Error;
use crate::execute::{Execute, ExecuteError, Phase, Stop};

/// Function pointer used for jumping into a region.
type Entry = extern "C" fn();

/// Set while some [`Tracee`] exists anywhere in this process.
static TRACEE_LIVE: AtomicBool = AtomicBool::new(false);

/// Exclusive right to have a tracee. Only one can exist per process at a
/// time; dropping it hands the right back.
#[derive(Debug)]
struct TraceClaim(());

impl TraceClaim {
    fn take() -> Self {
        let taken = TRACEE_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(taken, "another tracee is already live in this process");
        TraceClaim(())
    }
}

impl Drop for TraceClaim {
    fn drop(&mut self) {
        TRACEE_LIVE.store(false, Ordering::Release);
    }
}

/// Runs code regions in a forked child under `ptrace`, one at a time.
///
/// At most one tracee is alive in the whole process. It survives the end of
/// [`Execute::execute_with_steps`] so its memory can be read back, and goes
/// away on [`Execute::dispose_execution`] or when this value is dropped.
///
/// Not `Send`: ptrace requests have to come from the thread that forked.
pub struct PtraceExecute {
    config: Config,
    tracee: Option<Tracee>,
    _thread_bound: PhantomData<*const ()>,
}

/// The live child of an execution.
///
/// Cannot be cloned; the owning [`PtraceExecute`] is the only party allowed
/// to resume, step or kill it.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    // Set once a wait returned an exit or kill status: the pid may be reused.
    reaped: bool,
    // Released only after the child is reaped.
    _claim: TraceClaim,
}

impl PtraceExecute {
    /// # Panics
    ///
    /// If a tracee of another `PtraceExecute` is still live.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// # Panics
    ///
    /// If a tracee of another `PtraceExecute` is still live.
    pub fn with_config(config: Config) -> Self {
        assert!(
            !TRACEE_LIVE.load(Ordering::Acquire),
            "another tracee is already live in this process"
        );

        Self {
            config,
            tracee: None,
            _thread_bound: PhantomData,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Child of the last execution, until it is disposed.
    pub fn tracee(&self) -> Option<&Tracee> {
        self.tracee.as_ref()
    }

    fn release(&mut self) {
        let Some(tracee) = self.tracee.take() else {
            return;
        };
        let pid = tracee.pid;

        if let Err(err) = tracee.kill() {
            // A second panic while unwinding would abort the whole process.
            if thread::panicking() {
                warn!("reaping {pid} failed during unwind: {err}");
            } else {
                panic!("reaping {pid} failed: {err}");
            }
        }
    }
}

impl Default for PtraceExecute {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PtraceExecute {
    fn drop(&mut self) {
        self.release();
    }
}

impl Execute for PtraceExecute {
    /// Returns the instruction pointer read right after the instruction.
    ///
    /// # Panics
    ///
    /// If the previous tracee was not disposed, if another controller has a
    /// live tracee, if `steps_before` is zero, or if a fork, ptrace or wait
    /// request fails.
    fn execute_with_steps(
        &mut self,
        start: u64,
        steps_before: u32,
        steps_after: u32,
    ) -> Result<u64, ExecuteError> {
        assert!(
            self.tracee.is_none(),
            "previous execution must be disposed before starting a new one"
        );
        assert!(
            steps_before >= 1,
            "steps_before counts the entry trap and must be at least 1"
        );

        debug!("forking to execute {start:#x} ({steps_before} steps before, {steps_after} after)");
        let tracee = self.tracee.insert(Tracee::fork(start));
        let config = &self.config;

        tracee.attach(config)?;

        // The trap already took the first step.
        tracee.step(config, steps_before - 1, Phase::Before, 0)?;

        let ip = tracee.instruction_pointer();
        debug!("{} executing instruction at {ip:#x}", tracee.pid);
        tracee.step(config, 1, Phase::Instruction, ip)?;

        let ip = tracee.instruction_pointer();
        debug!("{} instruction executed, ip {ip:#x}", tracee.pid);
        tracee.step(config, steps_after, Phase::After, ip)?;

        Ok(ip)
    }

    fn dispose_execution(&mut self) {
        self.release();
    }
}

impl Tracee {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn fork(start: u64) -> Self {
        let claim = TraceClaim::take();

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Self {
                pid: child,
                reaped: false,
                _claim: claim,
            },
            Ok(ForkResult::Child) => unsafe { Self::run_child(start) },
            Err(err) => panic!("fork failed: {err}"),
        }
    }

    /// Child side. Only async-signal-safe calls past this point: no logging,
    /// no allocation, no unwinding back into the parent's stack.
    unsafe fn run_child(start: u64) -> ! {
        if ptrace::traceme().is_err() {
            libc::_exit(1);
        }

        // Let the parent see us stopped before any of the region runs.
        let _ = signal::raise(Signal::SIGSTOP);

        let entry: Entry = mem::transmute(start as usize as *const ());
        entry();

        libc::_exit(0)
    }

    /// Waits for the initial `SIGSTOP`, then resumes until the entry trap.
    fn attach(&mut self, config: &Config) -> Result<(), ExecuteError> {
        let before = |stop| ExecuteError::Before { stop };

        match self.wait(config) {
            Ok(Signal::SIGSTOP) => {}
            Ok(other) => return Err(before(Stop::Signal(other))),
            Err(stop) => return Err(before(stop)),
        }
        debug!("{} attached, continuing to the entry trap", self.pid);

        ptrace::cont(self.pid, None)
            .unwrap_or_else(|err| panic!("PTRACE_CONT on {} failed: {err}", self.pid));
        self.expect_trap(config).map_err(before)?;

        debug!("{} reached the entry trap", self.pid);
        Ok(())
    }

    /// Single steps `count` times. Every step has to end in a `SIGTRAP`
    /// stop, anything else is a fault of `phase`.
    fn step(
        &mut self,
        config: &Config,
        count: u32,
        phase: Phase,
        ip: u64,
    ) -> Result<(), ExecuteError> {
        for _ in 0..count {
            ptrace::step(self.pid, None)
                .unwrap_or_else(|err| panic!("PTRACE_SINGLESTEP on {} failed: {err}", self.pid));

            if let Err(stop) = self.expect_trap(config) {
                debug!("{} faulted ({phase:?}): {stop:?}", self.pid);
                return Err(ExecuteError::in_phase(phase, ip, stop));
            }

            self.trace_location();
        }

        Ok(())
    }

    fn expect_trap(&mut self, config: &Config) -> Result<(), Stop> {
        match self.wait(config)? {
            Signal::SIGTRAP => Ok(()),
            other => Err(Stop::Signal(other)),
        }
    }

    /// Blocks until the tracee stops, returning the stop signal. Exits, kills
    /// and timeouts come back as the error.
    fn wait(&mut self, config: &Config) -> Result<Signal, Stop> {
        let deadline = config.step_timeout.map(|timeout| Instant::now() + timeout);
        let flags = deadline.map(|_| WaitPidFlag::WNOHANG);

        loop {
            let status = match waitpid(self.pid, flags) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(err) => panic!("waitpid({}) failed: {err}", self.pid),
            };

            match status {
                WaitStatus::Stopped(_, signal) => return Ok(signal),
                WaitStatus::Exited(_, code) => {
                    self.reaped = true;
                    return Err(Stop::Exited(code));
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.reaped = true;
                    return Err(Stop::Killed(signal));
                }
                WaitStatus::StillAlive => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        warn!("{} did not stop within {:?}", self.pid, config.step_timeout);
                        return Err(Stop::TimedOut);
                    }
                    thread::sleep(config.poll_interval);
                }
                other => panic!("unexpected wait status for {}: {other:?}", self.pid),
            }
        }
    }

    /// Only meaningful while stopped after a trap.
    fn instruction_pointer(&self) -> u64 {
        ptrace::getregs(self.pid)
            .unwrap_or_else(|err| panic!("PTRACE_GETREGS on {} failed: {err}", self.pid))
            .instruction_pointer()
    }

    fn trace_location(&self) {
        if !log_enabled!(Level::Trace) {
            return;
        }

        let ip = self.instruction_pointer();
        match self.peek(ip) {
            Ok(word) => trace!("{} ip {ip:#x} mem {:#x}", self.pid, word),
            Err(_) => trace!("{} ip {ip:#x} mem unreadable", self.pid),
        }
    }

    pub(crate) fn peek(&self, addr: u64) -> Result<libc::c_long, Error> {
        ptrace::read(self.pid, addr as usize as *mut c_void)
            .map_err(|source| Error::Peek { addr, source })
    }

    /// `SIGKILL`, detach, and reap, so no zombie is left behind.
    fn kill(self) -> Result<(), Errno> {
        if self.reaped {
            debug!("{} already reaped", self.pid);
            return Ok(());
        }
        debug!("detaching and killing {}", self.pid);

        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(err),
        }
        // Only succeeds while the tracee sits in a ptrace stop; SIGKILL is
        // delivered either way.
        let _ = ptrace::detach(self.pid, None);

        // Stops queued before the kill are skipped until the exit shows up.
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(status) => trace!("{} reaping, skipped {status:?}", self.pid),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => break,
                Err(err) => return Err(err),
            }
        }
        debug!("{} reaped", self.pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{NOP, TRAP};
    use crate::region::Region;
    use serial_test::serial;

    fn code(bytes: &[u8]) -> Region {
        let mut region = Region::new(0x1000).unwrap();
        region.as_mut_slice().fill(NOP);
        region.write(&TRAP);
        region.write_at(1, bytes);
        region
    }

    #[test]
    #[serial(ptrace)]
    fn new_controller_has_no_tracee() {
        let mut exec = PtraceExecute::new();
        assert!(exec.tracee().is_none());
        exec.dispose_execution();
        assert!(exec.tracee().is_none());
    }

    #[test]
    #[serial(ptrace)]
    #[should_panic(expected = "steps_before counts the entry trap")]
    fn zero_steps_before_is_rejected() {
        let mut exec = PtraceExecute::new();
        let _ = exec.execute_with_steps(0, 0, 0);
    }

    #[test]
    #[serial(ptrace)]
    fn tracee_is_kept_until_disposed() {
        let region = code(&[NOP]);
        let mut exec = PtraceExecute::new();

        exec.execute_with_steps(region.addr(), 1, 0).unwrap();
        assert!(exec.tracee().is_some());

        exec.dispose_execution();
        assert!(exec.tracee().is_none());
    }

    #[test]
    #[serial(ptrace)]
    #[should_panic(expected = "previous execution must be disposed")]
    fn second_execution_needs_dispose() {
        let region = code(&[NOP]);
        let mut exec = PtraceExecute::new();

        let _ = exec.execute_with_steps(region.addr(), 1, 0);
        let _ = exec.execute_with_steps(region.addr(), 1, 0);
    }

    #[test]
    #[serial(ptrace)]
    #[should_panic(expected = "another tracee is already live")]
    fn second_controller_rejected_while_tracee_live() {
        let region = code(&[NOP]);
        let mut first = PtraceExecute::new();
        first.execute_with_steps(region.addr(), 1, 0).unwrap();

        let _second = PtraceExecute::new();
    }

    #[test]
    #[serial(ptrace)]
    #[should_panic(expected = "another tracee is already live")]
    fn second_tracee_rejected_across_controllers() {
        let region = code(&[NOP]);
        let mut first = PtraceExecute::new();
        let mut second = PtraceExecute::new();

        first.execute_with_steps(region.addr(), 1, 0).unwrap();
        let _ = second.execute_with_steps(region.addr(), 1, 0);
    }

    #[test]
    #[serial(ptrace)]
    fn claim_is_released_by_dispose_and_drop() {
        let region = code(&[NOP]);

        let mut first = PtraceExecute::new();
        first.execute_with_steps(region.addr(), 1, 0).unwrap();
        assert!(TRACEE_LIVE.load(Ordering::Acquire));
        first.dispose_execution();
        assert!(!TRACEE_LIVE.load(Ordering::Acquire));

        {
            let mut second = PtraceExecute::new();
            second.execute_with_steps(region.addr(), 1, 0).unwrap();
        }
        assert!(!TRACEE_LIVE.load(Ordering::Acquire));

        let mut third = PtraceExecute::new();
        third.execute_with_steps(region.addr(), 1, 0).unwrap();
        third.dispose_execution();
    }

    #[test]
    #[serial(ptrace)]
    fn unwinding_drop_reaps_and_releases_the_claim() {
        let region = code(&[NOP]);
        let addr = region.addr();

        let pid = std::sync::Mutex::new(None);
        let result = std::panic::catch_unwind(|| {
            let mut exec = PtraceExecute::new();
            exec.execute_with_steps(addr, 1, 0).unwrap();
            *pid.lock().unwrap() = exec.tracee().map(Tracee::pid);
            panic!("caller failed while the tracee was live");
        });

        assert!(result.is_err());
        let pid = pid.into_inner().unwrap().unwrap();
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        assert!(!TRACEE_LIVE.load(Ordering::Acquire));
    }

    #[test]
    #[serial(ptrace)]
    fn exit_before_trap_marks_tracee_reaped() {
        // exit_group(7) without any entry trap.
        #[cfg(target_arch = "x86_64")]
        let exit: &[u8] = &[
            0xb8, 0xe7, 0x00, 0x00, 0x00, // mov eax, 231
            0xbf, 0x07, 0x00, 0x00, 0x00, // mov edi, 7
            0x0f, 0x05, // syscall
        ];
        #[cfg(target_arch = "x86")]
        let exit: &[u8] = &[
            0xb8, 0xfc, 0x00, 0x00, 0x00, // mov eax, 252
            0xbb, 0x07, 0x00, 0x00, 0x00, // mov ebx, 7
            0xcd, 0x80, // int 0x80
        ];

        let mut region = Region::new(0x1000).unwrap();
        region.write(exit);
        let mut exec = PtraceExecute::new();

        let err = exec.execute_with_steps(region.addr(), 1, 0).unwrap_err();
        assert_eq!(err, ExecuteError::Before { stop: Stop::Exited(7) });
        assert!(exec.tracee().is_some_and(|tracee| tracee.reaped));

        exec.dispose_execution();
    }
}
