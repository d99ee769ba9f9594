//! Per-architecture bits: which register is the program counter, and the
//! instruction bytes callers need to build a code region.

use libc::user_regs_struct;

/// `int3`. Must be the first byte of every executed region.
pub const TRAP: [u8; 1] = [0xcc];

/// One-byte `nop`.
pub const NOP: u8 = 0x90;

/// Register file as returned by `PTRACE_GETREGS`.
pub(crate) trait Registers {
    fn instruction_pointer(&self) -> u64;
}

#[cfg(target_arch = "x86_64")]
impl Registers for user_regs_struct {
    fn instruction_pointer(&self) -> u64 {
        self.rip
    }
}

#[cfg(target_arch = "x86")]
impl Registers for user_regs_struct {
    fn instruction_pointer(&self) -> u64 {
        self.eip as u32 as u64
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("unsupported architecture: only x86 and x86_64 can be single stepped");

/// Size of a page as reported by `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> usize {
    // Never fails on Linux; 4K is what every supported target uses anyway.
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) => size as usize,
        _ => 4096,
    }
}
