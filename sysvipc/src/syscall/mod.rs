//! Syscall numbers, errno values and argument decoding for the emulated
//! SysV IPC surface.
//!
//! NOTE: numbers and errno constants follow the Linux x86_64 ABI.

use crate::tracee::TraceeContext;

/// Syscall numbers (x86_64).
pub mod nr {
    pub const GETPID: u64 = 39;
    pub const SEMGET: u64 = 64;
    pub const SEMOP: u64 = 65;
    pub const SEMCTL: u64 = 66;
    pub const MSGGET: u64 = 68;
    pub const MSGSND: u64 = 69;
    pub const MSGRCV: u64 = 70;
    pub const MSGCTL: u64 = 71;
    pub const SEMTIMEDOP: u64 = 220;
    pub const PPOLL: u64 = 271;
}

/// Syscall errors (negative = errno).
pub mod errno {
    pub const ENOENT: i64 = -2;
    pub const EINTR: i64 = -4;
    pub const E2BIG: i64 = -7;
    pub const EAGAIN: i64 = -11;
    pub const ENOMEM: i64 = -12;
    pub const EFAULT: i64 = -14;
    pub const EEXIST: i64 = -17;
    pub const EINVAL: i64 = -22;
    pub const EFBIG: i64 = -27;
    pub const ENOSPC: i64 = -28;
    pub const ERANGE: i64 = -34;
    pub const ENOMSG: i64 = -42;    // No message of desired type
    pub const EIDRM: i64 = -43;     // Identifier removed
    pub const EMSGSIZE: i64 = -90;  // Message too long
}

// ======================== Argument decoding ========================

/// An intercepted IPC syscall with its raw register arguments decoded.
///
/// Pointers stay raw here; they are validated when the handler touches
/// tracee memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcSyscall {
    MsgGet { key: i32, flags: i32 },
    MsgSnd { id: i32, msgp: u64, size: i64, flags: i32 },
    MsgRcv { id: i32, msgp: u64, size: i64, msgtyp: i64, flags: i32 },
    MsgCtl { id: i32, cmd: i32, buf: u64 },
    SemGet { key: i32, nsems: i32, flags: i32 },
    SemOp { id: i32, sops: u64, nsops: u64, timeout: Option<u64> },
    SemCtl { id: i32, semnum: i32, cmd: i32, arg: u64 },
}

impl IpcSyscall {
    /// Decodes the syscall the tracee is entering, or `None` if it is not
    /// one of ours.
    pub fn decode(tracee: &dyn TraceeContext) -> Option<Self> {
        let arg = |n: usize| tracee.syscall_arg(n);
        // int arguments live in the low half of the register
        let int = |n: usize| tracee.syscall_arg(n) as i32;

        let call = match tracee.syscall_number() {
            nr::MSGGET => IpcSyscall::MsgGet { key: int(0), flags: int(1) },
            nr::MSGSND => IpcSyscall::MsgSnd {
                id: int(0),
                msgp: arg(1),
                size: arg(2) as i64,
                flags: int(3),
            },
            nr::MSGRCV => IpcSyscall::MsgRcv {
                id: int(0),
                msgp: arg(1),
                size: arg(2) as i64,
                msgtyp: arg(3) as i64,
                flags: int(4),
            },
            nr::MSGCTL => IpcSyscall::MsgCtl { id: int(0), cmd: int(1), buf: arg(2) },
            nr::SEMGET => IpcSyscall::SemGet { key: int(0), nsems: int(1), flags: int(2) },
            nr::SEMOP => IpcSyscall::SemOp {
                id: int(0),
                sops: arg(1),
                nsops: arg(2),
                timeout: None,
            },
            nr::SEMTIMEDOP => IpcSyscall::SemOp {
                id: int(0),
                sops: arg(1),
                nsops: arg(2),
                // a NULL timeout means semop semantics
                timeout: Some(arg(3)).filter(|&p| p != 0),
            },
            nr::SEMCTL => IpcSyscall::SemCtl {
                id: int(0),
                semnum: int(1),
                cmd: int(2),
                arg: arg(3),
            },
            _ => return None,
        };
        Some(call)
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            IpcSyscall::MsgGet { .. } => "msgget",
            IpcSyscall::MsgSnd { .. } => "msgsnd",
            IpcSyscall::MsgRcv { .. } => "msgrcv",
            IpcSyscall::MsgCtl { .. } => "msgctl",
            IpcSyscall::SemGet { .. } => "semget",
            IpcSyscall::SemOp { timeout: None, .. } => "semop",
            IpcSyscall::SemOp { timeout: Some(_), .. } => "semtimedop",
            IpcSyscall::SemCtl { .. } => "semctl",
        }
    }
}
