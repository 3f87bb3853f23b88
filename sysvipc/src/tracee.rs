//! Interfaces the surrounding tracer provides to the IPC emulation.
//!
//! The emulation never talks to ptrace directly. Register and memory access
//! for the tracee whose stop is being handled comes in through
//! [`TraceeContext`]; tracer-wide services (the internal wakeup signal and
//! clocks) come in through [`Host`].

use alloc::vec::Vec;
use core::time::Duration;

use x86_64::VirtAddr;

use crate::util::{IpcError, IpcResult};

/// Process id of a tracee, as the kernel reports it.
pub type Pid = i32;

/// Credentials stamped into the permission block of created objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Register and memory access for one stopped tracee.
pub trait TraceeContext {
    fn pid(&self) -> Pid;

    /// Effective credentials of the tracee.
    fn credentials(&self) -> Credentials;

    /// Syscall number of the current syscall stop.
    fn syscall_number(&self) -> u64;

    /// Syscall argument `index` (0-based, x86_64 order rdi, rsi, rdx, r10, r8, r9).
    fn syscall_arg(&self, index: usize) -> u64;

    /// Rewrites the syscall number at a syscall-entry stop.
    fn set_syscall_number(&mut self, nr: u64);

    /// Rewrites syscall argument `index`.
    fn set_syscall_arg(&mut self, index: usize, value: u64);

    /// Sets the value the tracee sees as the syscall result (exit stop only).
    fn set_return_value(&mut self, value: i64);

    /// At a syscall-exit stop, rewinds the instruction pointer onto the
    /// syscall instruction and loads `nr`/`args` so the tracee immediately
    /// enters another syscall when resumed.
    fn restart_syscall(&mut self, nr: u64, args: [u64; 6]);

    fn read_memory(&self, addr: VirtAddr, buf: &mut [u8]) -> IpcResult<()>;

    fn write_memory(&mut self, addr: VirtAddr, data: &[u8]) -> IpcResult<()>;

    /// Reads `len` bytes into a fresh buffer.
    ///
    /// Allocation failure is reported as `ENOMEM` to the calling syscall only.
    fn read_vec(&self, addr: VirtAddr, len: usize) -> IpcResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| IpcError::NoMemory)?;
        buf.resize(len, 0);
        self.read_memory(addr, &mut buf)?;
        Ok(buf)
    }
}

/// Tracer-wide services.
pub trait Host {
    /// Delivers the internal wakeup signal to `pid`, interrupting the
    /// `ppoll` it is parked in. The tracer must later report that signal
    /// through [`SignalKind::Wakeup`] so it can be suppressed.
    fn send_wakeup(&mut self, pid: Pid);

    /// Wall clock in seconds since the epoch, for IPC timestamps.
    fn realtime_secs(&self) -> i64;

    /// Monotonic clock, for semtimedop deadlines.
    fn monotonic(&self) -> Duration;
}

/// Origin of a signal-delivery stop reported by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// The internal signal sent through [`Host::send_wakeup`].
    Wakeup,
    /// Any other signal.
    External,
}

/// What the tracer should do with a reported signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Suppress,
    Deliver,
}

// ======================== Tracee pointers ========================

/// Validates a raw pointer argument from the tracee.
pub fn user_addr(raw: u64) -> IpcResult<VirtAddr> {
    if raw == 0 {
        return Err(IpcError::Fault);
    }
    VirtAddr::try_new(raw).map_err(|_| IpcError::Fault)
}

/// `addr + offset`, rejecting overflow and non-canonical results.
pub fn offset_addr(addr: VirtAddr, offset: u64) -> IpcResult<VirtAddr> {
    let raw = addr.as_u64().checked_add(offset).ok_or(IpcError::Fault)?;
    VirtAddr::try_new(raw).map_err(|_| IpcError::Fault)
}

/// Reads a native-endian `i64` (the `mtype` header of a message buffer).
pub fn read_i64(tracee: &dyn TraceeContext, addr: VirtAddr) -> IpcResult<i64> {
    let mut raw = [0u8; 8];
    tracee.read_memory(addr, &mut raw)?;
    Ok(i64::from_ne_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_non_canonical_pointers_fault() {
        assert_eq!(user_addr(0), Err(IpcError::Fault));
        assert_eq!(user_addr(0x0000_8000_0000_0000), Err(IpcError::Fault));
        assert_eq!(user_addr(0x1000).map(VirtAddr::as_u64), Ok(0x1000));
    }

    #[test]
    fn offset_rejects_overflow() {
        let top = user_addr(0x0000_7fff_ffff_fff8).unwrap();
        assert!(offset_addr(top, 7).is_ok());
        assert_eq!(offset_addr(top, 8), Err(IpcError::Fault));
    }
}
