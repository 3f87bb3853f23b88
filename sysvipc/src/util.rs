//! Error type shared by every emulated IPC operation.

use crate::syscall::errno;

/// Failures of emulated IPC operations.
///
/// Each variant maps onto exactly one Linux errno, which is what the traced
/// program eventually observes as the syscall's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("invalid argument or stale identifier")]
    Invalid,
    #[error("identifier removed")]
    Removed,
    #[error("no object for key")]
    NotFound,
    #[error("object for key already exists")]
    AlreadyExists,
    #[error("operation would block")]
    WouldBlock,
    #[error("no message of the requested type")]
    NoMessage,
    #[error("message does not fit the receive buffer")]
    TooBig,
    #[error("message exceeds the maximum message size")]
    MessageSize,
    #[error("out of memory")]
    NoMemory,
    #[error("identifier space exhausted")]
    NoSpace,
    #[error("bad address in tracee memory")]
    Fault,
    #[error("semaphore number out of range")]
    SemaphoreIndex,
    #[error("semaphore value out of range")]
    OutOfRange,
    #[error("interrupted by a signal")]
    Interrupted,
}

impl IpcError {
    /// Negative errno as written into the tracee's return register.
    pub const fn errno(self) -> i64 {
        match self {
            IpcError::Invalid => errno::EINVAL,
            IpcError::Removed => errno::EIDRM,
            IpcError::NotFound => errno::ENOENT,
            IpcError::AlreadyExists => errno::EEXIST,
            IpcError::WouldBlock => errno::EAGAIN,
            IpcError::NoMessage => errno::ENOMSG,
            IpcError::TooBig => errno::E2BIG,
            IpcError::MessageSize => errno::EMSGSIZE,
            IpcError::NoMemory => errno::ENOMEM,
            IpcError::NoSpace => errno::ENOSPC,
            IpcError::Fault => errno::EFAULT,
            IpcError::SemaphoreIndex => errno::EFBIG,
            IpcError::OutOfRange => errno::ERANGE,
            IpcError::Interrupted => errno::EINTR,
        }
    }
}

pub type IpcResult<T> = core::result::Result<T, IpcError>;

/// Collapses a handler result into the raw syscall return value.
pub fn result_to_i64(res: IpcResult<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(e) => e.errno(),
    }
}
