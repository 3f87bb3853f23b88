//! SysV IPC emulation.
//!
//! [`SysVIpc`] owns the tracee table and is driven by the tracer's stops:
//! syscall entry and exit, signal delivery, tracee creation and exit. IPC
//! syscalls never reach the kernel. At entry they are executed against the
//! tracee's namespace and the real syscall is replaced by `getpid`, whose
//! exit carries the emulated result back. A call that has to block parks the
//! tracee in `ppoll` (see [`wait`]) until [`wake`] decides the call can make
//! progress.

pub mod abi;
pub mod msg;
pub mod namespace;
pub mod sem;
pub mod slots;
pub mod wait;
pub mod wake;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use log::{debug, trace, warn};

use crate::syscall::{nr, IpcSyscall};
use crate::tracee::{Host, Pid, SignalDisposition, SignalKind, TraceeContext};
use crate::util::{result_to_i64, IpcError, IpcResult};

pub use msg::{Message, MsgQueue, MSGMAX, MSGMNB};
pub use namespace::{IpcNamespace, NamespaceId, SharedNamespace};
pub use sem::{SemOpFlags, SemSet, UndoList, SEMMSL, SEMOPM, SEMVMX};
pub use slots::IpcId;
pub use wait::{WaitReason, WaitRequest, WaitState};

use wait::{Resume, WaitController};

/// Key that always creates a new object.
pub const IPC_PRIVATE: i32 = 0;

// ctl commands shared by msgctl and semctl
pub const IPC_RMID: i32 = 0;
pub const IPC_SET: i32 = 1;
pub const IPC_STAT: i32 = 2;

bitflags::bitflags! {
    /// `msgflg`/`semflg` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: i32 {
        const IPC_CREAT   = 0o1000;
        const IPC_EXCL    = 0o2000;
        const IPC_NOWAIT  = 0o4000;
        const MSG_NOERROR = 0o10000;
        const MSG_EXCEPT  = 0o20000;
        const MSG_COPY    = 0o40000;
    }
}

/// Tunable limits, the emulated counterparts of the `kernel.msg*` and
/// `kernel.sem` sysctls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcLimits {
    /// Largest message body accepted by msgsnd.
    pub msgmax: usize,
    /// Byte quota of a new queue.
    pub msgmnb: usize,
    /// Largest semaphore set.
    pub semmsl: usize,
    /// Most operations in one semop call.
    pub semopm: usize,
    /// Largest semaphore value.
    pub semvmx: u16,
}

impl Default for IpcLimits {
    fn default() -> Self {
        Self {
            msgmax: MSGMAX,
            msgmnb: MSGMNB,
            semmsl: SEMMSL,
            semopm: SEMOPM,
            semvmx: SEMVMX,
        }
    }
}

/// Everything a handler needs to execute one call.
pub(crate) struct Call<'a> {
    pub ns: &'a mut IpcNamespace,
    pub tracee: &'a mut dyn TraceeContext,
    pub limits: &'a IpcLimits,
    /// Wall clock seconds for the `*_time` fields.
    pub now: i64,
    pub monotonic: Duration,
    pub undo: &'a mut UndoList,
    /// Set by a handler whose effect may let parked tracees proceed.
    pub wake: Option<Wake>,
}

/// Outcome of a handler.
pub(crate) enum Completion {
    Done(i64),
    Block(WaitRequest),
}

/// A state change the wake dispatcher has to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Queue(IpcId),
    QueueRemoved(IpcId),
    Semaphores(IpcId),
    SemaphoresRemoved(IpcId),
    /// SETVAL (one semaphore) or SETALL (`sem_num: None`).
    SemaphoresReset { id: IpcId, sem_num: Option<u16> },
}

/// Per-tracee IPC state.
pub struct TraceeIpc {
    namespace: SharedNamespace,
    namespace_id: NamespaceId,
    wait: WaitController,
    /// Result to inject at the exit of the substituted `getpid`.
    pending_result: Option<i64>,
    /// A signal handler made a syscall while the wait was pending; its exit
    /// stop is not the wait's.
    nested_syscall: bool,
    undo: UndoList,
}

impl TraceeIpc {
    fn new(namespace: SharedNamespace) -> Self {
        let namespace_id = namespace.lock().id();
        Self {
            namespace,
            namespace_id,
            wait: WaitController::new(),
            pending_result: None,
            nested_syscall: false,
            undo: UndoList::new(),
        }
    }

    fn fresh() -> Self {
        Self::new(IpcNamespace::new_shared())
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }
}

/// How a new tracee joins a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// A namespace of its own.
    New,
    /// The namespace of an existing tracee (fork/clone without CLONE_NEWIPC).
    ShareWith(Pid),
}

/// What the emulation did with a syscall stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Not an IPC stop; leave the tracee alone.
    Ignored,
    /// Registers were rewritten; resume the tracee.
    Emulated,
    /// The tracee is parked in its wait protocol; resume the tracee.
    Parked,
}

/// The SysV IPC emulation for all tracees of one tracer.
pub struct SysVIpc {
    tracees: BTreeMap<Pid, TraceeIpc>,
    limits: IpcLimits,
}

impl SysVIpc {
    pub fn new() -> Self {
        Self::with_limits(IpcLimits::default())
    }

    pub fn with_limits(limits: IpcLimits) -> Self {
        Self { tracees: BTreeMap::new(), limits }
    }

    pub fn limits(&self) -> &IpcLimits {
        &self.limits
    }

    // ===== Tracee directory =====

    /// Registers a tracee. A tracee already known keeps its state.
    pub fn attach(&mut self, pid: Pid, membership: Membership) {
        if self.tracees.contains_key(&pid) {
            warn!("sysvipc: pid {} attached twice", pid);
            return;
        }
        let namespace = match membership {
            Membership::New => IpcNamespace::new_shared(),
            Membership::ShareWith(parent) => {
                let parent = self.tracees.entry(parent).or_insert_with(TraceeIpc::fresh);
                Arc::clone(&parent.namespace)
            }
        };
        let entry = TraceeIpc::new(namespace);
        debug!("sysvipc: attach pid {} to {:?}", pid, entry.namespace_id);
        self.tracees.insert(pid, entry);
    }

    /// Forgets an exited tracee: its wait is dropped and its SEM_UNDO
    /// adjustments are applied. The namespace goes away with its last member.
    pub fn detach(&mut self, pid: Pid, host: &mut dyn Host) {
        let Some(mut entry) = self.tracees.remove(&pid) else {
            return;
        };
        debug!("sysvipc: detach pid {}", pid);

        let namespace = Arc::clone(&entry.namespace);
        let mut ns = namespace.lock();
        let mut wakes = Vec::new();

        if let Some(request) = entry.wait.abandon() {
            release(&mut ns, &request);
            // a claim the tracee held may now go to someone else
            wakes.push(match request {
                WaitRequest::QueueRecv { id, .. } | WaitRequest::QueueSend { id, .. } => Wake::Queue(id),
                WaitRequest::Semop { id, .. } => Wake::Semaphores(id),
            });
        }

        for (id, adj) in entry.undo.take() {
            if sem::apply_undo(&mut ns, id, &adj, pid, self.limits.semvmx) {
                trace!("sysvipc: applied undo of pid {} to {:?}", pid, id);
                wakes.push(Wake::Semaphores(id));
            }
        }

        for change in wakes {
            wake::dispatch(&mut self.tracees, &ns, change, &self.limits, host);
        }
    }

    pub fn is_attached(&self, pid: Pid) -> bool {
        self.tracees.contains_key(&pid)
    }

    pub fn namespace_of(&self, pid: Pid) -> Option<SharedNamespace> {
        self.tracees.get(&pid).map(|t| Arc::clone(&t.namespace))
    }

    pub fn wait_state(&self, pid: Pid) -> Option<WaitState> {
        self.tracees.get(&pid).map(|t| t.wait.state())
    }

    pub fn wait_reason(&self, pid: Pid) -> Option<WaitReason> {
        self.tracees.get(&pid).map(|t| t.wait.reason())
    }

    // ===== Stop handling =====

    /// Syscall-entry stop.
    pub fn on_syscall_enter(&mut self, tracee: &mut dyn TraceeContext, host: &mut dyn Host) -> StopAction {
        let pid = tracee.pid();
        let nr = tracee.syscall_number();
        let mut nested = false;

        if let Some(entry) = self.tracees.get_mut(&pid) {
            match entry.wait.state() {
                WaitState::NotWaiting => {}
                WaitState::RestartedIntoPpoll if nr == nr::PPOLL => {
                    entry.wait.enter_ppoll();
                    trace!("sysvipc: pid {} entered ppoll", pid);
                    return StopAction::Parked;
                }
                WaitState::SignaledPpoll | WaitState::RestartedIntoPpollCanceled if nr == nr::PPOLL => {
                    // already decided; skip the sleep
                    tracee.set_syscall_number(nr::GETPID);
                    return StopAction::Emulated;
                }
                state @ (WaitState::EnteredGetpid | WaitState::EnteredPpoll) => {
                    warn!("sysvipc: pid {} entered syscall {} while {:?}", pid, nr, state);
                    return StopAction::Ignored;
                }
                state => {
                    // a signal handler runs before the rewound ppoll
                    trace!("sysvipc: pid {} handler syscall {} while {:?}", pid, nr, state);
                    entry.nested_syscall = true;
                    nested = true;
                }
            }
        }

        let Some(syscall) = IpcSyscall::decode(tracee) else {
            return StopAction::Ignored;
        };
        trace!("sysvipc: pid {} {} {:?}", pid, syscall.name(), syscall);

        let args: [u64; 6] = core::array::from_fn(|i| tracee.syscall_arg(i));
        let result = self.execute(tracee, host, |call| run(call, syscall));
        tracee.set_syscall_number(nr::GETPID);

        let Some(entry) = self.tracees.get_mut(&pid) else {
            return StopAction::Emulated;
        };
        match result {
            Ok(Completion::Done(value)) => {
                entry.pending_result = Some(value);
                StopAction::Emulated
            }
            Err(err) => {
                entry.pending_result = Some(err.errno());
                StopAction::Emulated
            }
            Ok(Completion::Block(request)) if nested => {
                // the pending wait owns the tracee's ppoll
                release(&mut entry.namespace.lock(), &request);
                entry.pending_result = Some(IpcError::Interrupted.errno());
                StopAction::Emulated
            }
            Ok(Completion::Block(request)) => {
                entry.wait.park(request, args);
                StopAction::Parked
            }
        }
    }

    /// Syscall-exit stop.
    pub fn on_syscall_exit(&mut self, tracee: &mut dyn TraceeContext, host: &mut dyn Host) -> StopAction {
        let pid = tracee.pid();
        let Some(entry) = self.tracees.get_mut(&pid) else {
            return StopAction::Ignored;
        };

        let nested = core::mem::take(&mut entry.nested_syscall);
        if let Some(value) = entry.pending_result.take() {
            tracee.set_return_value(value);
            return StopAction::Emulated;
        }
        if nested {
            return StopAction::Ignored;
        }

        match entry.wait.state() {
            WaitState::NotWaiting => StopAction::Ignored,
            WaitState::EnteredGetpid => {
                entry.wait.restart_into_ppoll();
                tracee.restart_syscall(nr::PPOLL, [0; 6]);
                StopAction::Parked
            }
            WaitState::EnteredPpoll | WaitState::RestartedIntoPpoll => {
                // ppoll ended without our wakeup: a signal we were not told about
                warn!("sysvipc: pid {} left ppoll unexpectedly", pid);
                if let Some(request) = entry.wait.cancel() {
                    release(&mut entry.namespace.lock(), &request);
                }
                self.finish_wait(tracee, host)
            }
            WaitState::SignaledPpoll | WaitState::RestartedIntoPpollCanceled => self.finish_wait(tracee, host),
        }
    }

    /// Signal-delivery stop. The internal wakeup signal is always
    /// suppressed; a foreign signal cancels a wait that has not been woken.
    pub fn on_signal(&mut self, pid: Pid, kind: SignalKind) -> SignalDisposition {
        if kind == SignalKind::Wakeup {
            return SignalDisposition::Suppress;
        }
        if let Some(entry) = self.tracees.get_mut(&pid) {
            if let Some(request) = entry.wait.cancel() {
                release(&mut entry.namespace.lock(), &request);
            }
        }
        SignalDisposition::Deliver
    }

    /// Fails parked semtimedop calls whose deadline has passed with `EAGAIN`.
    /// Returns the number of tracees woken.
    pub fn expire_timeouts(&mut self, host: &mut dyn Host) -> usize {
        let now = host.monotonic();
        let mut expired = 0;
        for (&pid, entry) in self.tracees.iter_mut() {
            let due = match entry.wait.parked_request() {
                Some(WaitRequest::Semop { req, .. }) => req.deadline.is_some_and(|d| d <= now),
                _ => false,
            };
            if due {
                debug!("sysvipc: semtimedop of pid {} timed out", pid);
                wake::signal(pid, &mut entry.wait, Some(IpcError::WouldBlock), host);
                expired += 1;
            }
        }
        expired
    }

    // ===== Internals =====

    /// Runs `op` against the tracee's namespace and dispatches the wake it
    /// raises. Unknown tracees get a namespace of their own.
    fn execute<F>(&mut self, tracee: &mut dyn TraceeContext, host: &mut dyn Host, op: F) -> IpcResult<Completion>
    where
        F: FnOnce(&mut Call<'_>) -> IpcResult<Completion>,
    {
        let limits = self.limits;
        let entry = self.tracees.entry(tracee.pid()).or_insert_with(TraceeIpc::fresh);
        let namespace = Arc::clone(&entry.namespace);
        let mut ns = namespace.lock();

        let mut call = Call {
            ns: &mut *ns,
            tracee,
            limits: &limits,
            now: host.realtime_secs(),
            monotonic: host.monotonic(),
            undo: &mut entry.undo,
            wake: None,
        };
        let result = op(&mut call);
        let raised = call.wake.take();

        if let Some(change) = raised {
            wake::dispatch(&mut self.tracees, &ns, change, &limits, host);
        }
        result
    }

    /// Resolves a finished wait at the tracee's final syscall exit.
    fn finish_wait(&mut self, tracee: &mut dyn TraceeContext, host: &mut dyn Host) -> StopAction {
        let pid = tracee.pid();
        let Some(entry) = self.tracees.get_mut(&pid) else {
            return StopAction::Ignored;
        };
        let saved_args = entry.wait.saved_args();

        let result = match entry.wait.finish() {
            None => return StopAction::Ignored,
            Some(Resume::Fail(err, request)) => {
                if let Some(request) = request {
                    release(&mut entry.namespace.lock(), &request);
                }
                Err(err)
            }
            Some(Resume::Retry(request)) => self.execute(tracee, host, |call| retry(call, request)),
        };

        let value = match result {
            Ok(Completion::Block(request)) => {
                trace!("sysvipc: pid {} blocks again", pid);
                if let Some(entry) = self.tracees.get_mut(&pid) {
                    entry.wait.repark(request);
                }
                tracee.restart_syscall(nr::PPOLL, [0; 6]);
                return StopAction::Parked;
            }
            Ok(Completion::Done(value)) => Ok(value),
            Err(err) => Err(err),
        };

        for (index, &arg) in saved_args.iter().enumerate() {
            tracee.set_syscall_arg(index, arg);
        }
        let value = result_to_i64(value);
        trace!("sysvipc: pid {} resumes with {}", pid, value);
        tracee.set_return_value(value);
        StopAction::Emulated
    }
}

impl Default for SysVIpc {
    fn default() -> Self {
        Self::new()
    }
}

fn run(call: &mut Call<'_>, syscall: IpcSyscall) -> IpcResult<Completion> {
    match syscall {
        IpcSyscall::MsgGet { key, flags } => msg::sys_msgget(call, key, flags),
        IpcSyscall::MsgSnd { id, msgp, size, flags } => msg::sys_msgsnd(call, id, msgp, size, flags),
        IpcSyscall::MsgRcv { id, msgp, size, msgtyp, flags } => {
            msg::sys_msgrcv(call, id, msgp, size, msgtyp, flags)
        }
        IpcSyscall::MsgCtl { id, cmd, buf } => msg::sys_msgctl(call, id, cmd, buf),
        IpcSyscall::SemGet { key, nsems, flags } => sem::sys_semget(call, key, nsems, flags),
        IpcSyscall::SemOp { id, sops, nsops, timeout } => sem::sys_semop(call, id, sops, nsops, timeout),
        IpcSyscall::SemCtl { id, semnum, cmd, arg } => sem::sys_semctl(call, id, semnum, cmd, arg),
    }
}

fn retry(call: &mut Call<'_>, request: WaitRequest) -> IpcResult<Completion> {
    match request {
        WaitRequest::QueueRecv { id, req } => msg::receive(call, id, req),
        WaitRequest::QueueSend { id, req } => msg::send(call, id, req),
        WaitRequest::Semop { id, req } => {
            sem::release_waiter(call.ns, id, &req);
            sem::semop(call, id, req)
        }
    }
}

/// Undoes the waiter accounting of a request that will not be retried.
fn release(ns: &mut IpcNamespace, request: &WaitRequest) {
    if let WaitRequest::Semop { id, req } = request {
        sem::release_waiter(ns, *id, req);
    }
}
