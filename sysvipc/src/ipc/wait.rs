//! Per-tracee suspend/resume state machine.
//!
//! A faked syscall cannot be left blocking in the kernel, so a tracee that
//! has to wait is parked in a real syscall instead:
//!
//! ```text
//!  NotWaiting --park--> EnteredGetpid --getpid exit--> RestartedIntoPpoll
//!       ^                                                   |
//!       |                                              ppoll entry
//!       |                                                   v
//!       +--ppoll exit, retry-- SignaledPpoll <--wake-- EnteredPpoll
//!       |                                                   |
//!       +--exit, EINTR-- RestartedIntoPpollCanceled <--signal+
//! ```
//!
//! The intercepted syscall is first turned into `getpid` so its exit stop
//! gives the tracer a checkpoint, then the tracee is rewound into
//! `ppoll(NULL, 0, NULL, NULL)`, which only a signal ends. Every transition
//! below is driven by exactly one of: a handler decision, a syscall stop of a
//! known kind, or a reported signal.

use log::{debug, warn};

use super::msg::{RecvRequest, SendRequest};
use super::sem::SemopRequest;
use super::slots::IpcId;
use crate::util::IpcError;

/// Why a tracee is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    None,
    QueueRecv,
    QueueSend,
    Semop,
}

/// Phase of the suspend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    NotWaiting,
    /// Syscall rewritten to `getpid`, waiting for its exit.
    EnteredGetpid,
    /// Rewound into `ppoll`, waiting for its entry.
    RestartedIntoPpoll,
    /// Blocked in `ppoll`.
    EnteredPpoll,
    /// Condition satisfied (or failed); wakeup delivered or pending.
    SignaledPpoll,
    /// Interrupted by a foreign signal; reports `EINTR` at the next exit.
    RestartedIntoPpollCanceled,
}

/// A blocking request saved for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitRequest {
    QueueRecv { id: IpcId, req: RecvRequest },
    QueueSend { id: IpcId, req: SendRequest },
    Semop { id: IpcId, req: SemopRequest },
}

impl WaitRequest {
    pub fn reason(&self) -> WaitReason {
        match self {
            WaitRequest::QueueRecv { .. } => WaitReason::QueueRecv,
            WaitRequest::QueueSend { .. } => WaitReason::QueueSend,
            WaitRequest::Semop { .. } => WaitReason::Semop,
        }
    }

    /// The object waited on.
    pub fn object(&self) -> IpcId {
        match self {
            WaitRequest::QueueRecv { id, .. }
            | WaitRequest::QueueSend { id, .. }
            | WaitRequest::Semop { id, .. } => *id,
        }
    }
}

/// Result of [`WaitController::wake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeAction {
    /// Tracee sits in `ppoll`; the wakeup signal must be sent.
    SendSignal,
    /// Tracee has not reached `ppoll` yet; it will be diverted on its next stop.
    Deferred,
    /// Tracee was not parked; nothing changed.
    NotParked,
}

/// How a finished wait resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Run the saved request again.
    Retry(WaitRequest),
    /// Report `error`. The request, if still held, needs its waiter
    /// accounting released.
    Fail(IpcError, Option<WaitRequest>),
}

/// Wait state of one tracee.
#[derive(Debug, Clone)]
pub struct WaitController {
    state: WaitState,
    request: Option<WaitRequest>,
    status_after_wait: Option<IpcError>,
    /// Argument registers of the original syscall, restored on completion.
    saved_args: [u64; 6],
}

impl WaitController {
    pub const fn new() -> Self {
        Self {
            state: WaitState::NotWaiting,
            request: None,
            status_after_wait: None,
            saved_args: [0; 6],
        }
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    pub fn reason(&self) -> WaitReason {
        self.request.as_ref().map_or(WaitReason::None, WaitRequest::reason)
    }

    pub fn saved_args(&self) -> [u64; 6] {
        self.saved_args
    }

    /// Parked and not yet woken or canceled.
    pub fn is_parked(&self) -> bool {
        matches!(
            self.state,
            WaitState::EnteredGetpid | WaitState::RestartedIntoPpoll | WaitState::EnteredPpoll
        )
    }

    /// The request of a parked tracee.
    pub fn parked_request(&self) -> Option<&WaitRequest> {
        self.request.as_ref().filter(|_| self.is_parked())
    }

    /// The request of a tracee that was woken to retry it and has not
    /// reached its `ppoll` exit yet.
    pub fn pending_retry(&self) -> Option<&WaitRequest> {
        match (self.state, self.status_after_wait) {
            (WaitState::SignaledPpoll, None) => self.request.as_ref(),
            _ => None,
        }
    }

    /// Handler decision: the syscall blocks.
    pub fn park(&mut self, request: WaitRequest, saved_args: [u64; 6]) {
        if self.state != WaitState::NotWaiting {
            warn!("sysvipc: park in state {:?}", self.state);
        }
        debug!("sysvipc: parking on {:?} ({:?})", request.object(), request.reason());
        self.state = WaitState::EnteredGetpid;
        self.request = Some(request);
        self.status_after_wait = None;
        self.saved_args = saved_args;
    }

    /// A retry blocked again; the tracee goes straight back into `ppoll`.
    /// The saved registers and deadline stay those of the original call.
    pub fn repark(&mut self, request: WaitRequest) {
        self.state = WaitState::RestartedIntoPpoll;
        self.request = Some(request);
        self.status_after_wait = None;
    }

    /// Exit of the substituted `getpid`.
    pub fn restart_into_ppoll(&mut self) -> bool {
        if self.state != WaitState::EnteredGetpid {
            return false;
        }
        self.state = WaitState::RestartedIntoPpoll;
        true
    }

    /// Entry of the `ppoll` the tracee was rewound into.
    pub fn enter_ppoll(&mut self) -> bool {
        if self.state != WaitState::RestartedIntoPpoll {
            return false;
        }
        self.state = WaitState::EnteredPpoll;
        true
    }

    /// Wake dispatcher: the awaited condition holds, or the wait must end
    /// with `status`.
    pub fn wake(&mut self, status: Option<IpcError>) -> WakeAction {
        let action = match self.state {
            WaitState::EnteredPpoll => WakeAction::SendSignal,
            WaitState::EnteredGetpid | WaitState::RestartedIntoPpoll => WakeAction::Deferred,
            _ => return WakeAction::NotParked,
        };
        self.state = WaitState::SignaledPpoll;
        self.status_after_wait = status;
        action
    }

    /// A woken tracee's retry is overtaken: it reports `err` instead. The
    /// wakeup already sent or deferred still ends the wait.
    pub fn fail_pending(&mut self, err: IpcError) -> bool {
        if self.pending_retry().is_none() {
            return false;
        }
        debug!("sysvipc: pending retry on {:?} fails with {:?}", self.reason(), err);
        self.status_after_wait = Some(err);
        true
    }

    /// A foreign signal interrupted the wait.
    ///
    /// Returns the request so its waiter accounting can be released. A wait
    /// already woken is not canceled: the wake has been committed.
    pub fn cancel(&mut self) -> Option<WaitRequest> {
        if !self.is_parked() {
            return None;
        }
        debug!("sysvipc: wait canceled in state {:?}", self.state);
        self.state = WaitState::RestartedIntoPpollCanceled;
        self.status_after_wait = Some(IpcError::Interrupted);
        self.request.take()
    }

    /// Ends the wait at the final syscall exit.
    pub fn finish(&mut self) -> Option<Resume> {
        let resume = match self.state {
            WaitState::SignaledPpoll => match (self.status_after_wait.take(), self.request.take()) {
                (Some(err), request) => Resume::Fail(err, request),
                (None, Some(request)) => Resume::Retry(request),
                (None, None) => Resume::Fail(IpcError::Invalid, None),
            },
            WaitState::RestartedIntoPpollCanceled => {
                Resume::Fail(IpcError::Interrupted, self.request.take())
            }
            _ => return None,
        };
        self.state = WaitState::NotWaiting;
        self.status_after_wait = None;
        Some(resume)
    }

    /// Drops any wait (tracee exit). Returns the request still holding
    /// waiter accounting.
    pub fn abandon(&mut self) -> Option<WaitRequest> {
        self.state = WaitState::NotWaiting;
        self.status_after_wait = None;
        self.request.take()
    }
}

impl Default for WaitController {
    fn default() -> Self {
        Self::new()
    }
}
