//! SysV IPC emulation for a ptrace-based syscall tracer.
//!
//! Message queues (`msgget`, `msgsnd`, `msgrcv`, `msgctl`) and semaphore
//! sets (`semget`, `semop`, `semtimedop`, `semctl`) are implemented inside
//! the tracer and shared between tracees of the same IPC namespace. The
//! tracer drives everything through [`SysVIpc`]:
//!
//! - [`SysVIpc::attach`] / [`SysVIpc::detach`] on tracee creation and exit
//! - [`SysVIpc::on_syscall_enter`] / [`SysVIpc::on_syscall_exit`] at syscall stops
//! - [`SysVIpc::on_signal`] at signal-delivery stops
//! - [`SysVIpc::expire_timeouts`] periodically, for semtimedop deadlines
//!
//! Register and memory access come in through [`TraceeContext`], the wakeup
//! signal and clocks through [`Host`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ipc;
pub mod syscall;
pub mod tracee;
pub mod util;

pub use ipc::{IpcFlags, IpcId, IpcLimits, Membership, StopAction, SysVIpc, WaitReason, WaitState};
pub use tracee::{Credentials, Host, Pid, SignalDisposition, SignalKind, TraceeContext};
pub use util::{IpcError, IpcResult};
