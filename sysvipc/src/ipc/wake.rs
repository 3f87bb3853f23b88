//! Wake dispatcher.
//!
//! Runs after every change that may let parked tracees proceed. Candidates
//! are the members of the changed namespace, visited in pid order, whose
//! parked request names the changed object. Each candidate is checked
//! against a scratch view of the object that already accounts for what
//! earlier candidates (and tracees woken before but not yet retried) will
//! consume, so one message or one unit of a semaphore wakes one tracee.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{debug, trace};

use super::msg::MsgQueue;
use super::namespace::IpcNamespace;
use super::sem::simulate;
use super::slots::IpcId;
use super::wait::{WaitController, WaitRequest, WakeAction};
use super::{IpcFlags, IpcLimits, TraceeIpc, Wake};
use crate::tracee::{Host, Pid};
use crate::util::IpcError;

type Members<'t> = Vec<(Pid, &'t mut TraceeIpc)>;

/// Wakes the tracees `change` lets proceed. Returns how many were woken.
pub(crate) fn dispatch(
    tracees: &mut BTreeMap<Pid, TraceeIpc>,
    ns: &IpcNamespace,
    change: Wake,
    limits: &IpcLimits,
    host: &mut dyn Host,
) -> usize {
    let ns_id = ns.id();
    let mut members: Members<'_> = tracees
        .iter_mut()
        .filter(|(_, t)| t.namespace_id == ns_id)
        .map(|(&pid, t)| (pid, t))
        .collect();

    let woken = match change {
        Wake::Queue(id) => wake_queue(&mut members, ns, id, host),
        Wake::QueueRemoved(id) => fail_waiters(&mut members, id, is_queue_request, host),
        Wake::Semaphores(id) => wake_semaphores(&mut members, ns, id, limits.semvmx, host),
        Wake::SemaphoresReset { id, sem_num } => {
            for (_, tracee) in members.iter_mut() {
                tracee.undo.clear(id, sem_num);
            }
            wake_semaphores(&mut members, ns, id, limits.semvmx, host)
        }
        Wake::SemaphoresRemoved(id) => {
            for (_, tracee) in members.iter_mut() {
                tracee.undo.clear(id, None);
            }
            fail_waiters(&mut members, id, is_semop_request, host)
        }
    };

    if woken > 0 {
        debug!("sysvipc: {:?} woke {} tracee(s) in {:?}", change, woken, ns_id);
    }
    woken
}

/// Moves a parked tracee to `SignaledPpoll`, signaling it if it already
/// sleeps in `ppoll`.
pub(crate) fn signal(pid: Pid, wait: &mut WaitController, status: Option<IpcError>, host: &mut dyn Host) -> bool {
    match wait.wake(status) {
        WakeAction::SendSignal => {
            trace!("sysvipc: signaling pid {}", pid);
            host.send_wakeup(pid);
            true
        }
        WakeAction::Deferred => {
            trace!("sysvipc: wake of pid {} deferred until its next stop", pid);
            true
        }
        WakeAction::NotParked => false,
    }
}

fn is_queue_request(request: &WaitRequest) -> bool {
    matches!(request, WaitRequest::QueueRecv { .. } | WaitRequest::QueueSend { .. })
}

fn is_semop_request(request: &WaitRequest) -> bool {
    matches!(request, WaitRequest::Semop { .. })
}

/// The object is gone: every waiter on it fails with `EIDRM`, including
/// tracees woken earlier whose retry has not run yet.
fn fail_waiters(
    members: &mut Members<'_>,
    id: IpcId,
    waits_on_kind: fn(&WaitRequest) -> bool,
    host: &mut dyn Host,
) -> usize {
    let mut woken = 0;
    let waits_on = |r: &WaitRequest| waits_on_kind(r) && r.object() == id;
    for (pid, tracee) in members.iter_mut() {
        if tracee.wait.parked_request().is_some_and(waits_on) {
            if signal(*pid, &mut tracee.wait, Some(IpcError::Removed), host) {
                woken += 1;
            }
        } else if tracee.wait.pending_retry().is_some_and(waits_on) {
            // already signaled; only the retry's outcome changes
            tracee.wait.fail_pending(IpcError::Removed);
        }
    }
    woken
}

// ============================================================================
// Message queues
// ============================================================================

/// Queue contents as seen after the already admitted requests ran.
struct QueueView<'q> {
    queue: &'q MsgQueue,
    id: IpcId,
    claimed: Vec<usize>,
    bytes: usize,
    count: usize,
}

impl<'q> QueueView<'q> {
    fn new(queue: &'q MsgQueue, id: IpcId) -> Self {
        Self { queue, id, claimed: Vec::new(), bytes: queue.bytes(), count: queue.len() }
    }

    /// Whether `request` can make progress; if so, reserves what it consumes.
    fn admit(&mut self, request: &WaitRequest) -> bool {
        match request {
            WaitRequest::QueueRecv { id, req } if *id == self.id => {
                let Some(position) = self.queue.select(req.msgtyp, req.flags, &self.claimed) else {
                    return false;
                };
                let Some(msg) = self.queue.get(position) else {
                    return false;
                };
                let size = msg.data.len();
                // an oversized message is woken for its E2BIG but stays queued
                if !req.flags.contains(IpcFlags::MSG_COPY)
                    && (size <= req.size || req.flags.contains(IpcFlags::MSG_NOERROR))
                {
                    self.claimed.push(position);
                    self.bytes = self.bytes.saturating_sub(size);
                    self.count = self.count.saturating_sub(1);
                }
                true
            }
            WaitRequest::QueueSend { id, req } if *id == self.id => {
                let size = req.message.data.len();
                if !self.queue.fits(self.bytes, self.count, size) {
                    return false;
                }
                self.bytes += size;
                self.count += 1;
                true
            }
            _ => false,
        }
    }
}

fn wake_queue(members: &mut Members<'_>, ns: &IpcNamespace, id: IpcId, host: &mut dyn Host) -> usize {
    let Ok(queue) = ns.queues.lookup(id) else {
        return 0;
    };
    let mut view = QueueView::new(queue, id);

    for (_, tracee) in members.iter() {
        if let Some(request) = tracee.wait.pending_retry() {
            view.admit(request);
        }
    }

    let mut woken = 0;
    for (pid, tracee) in members.iter_mut() {
        let admitted = tracee.wait.parked_request().is_some_and(|r| view.admit(r));
        if admitted && signal(*pid, &mut tracee.wait, None, host) {
            woken += 1;
        }
    }
    woken
}

// ============================================================================
// Semaphore sets
// ============================================================================

/// Applies `request` to `scratch` if it is a semop on `id` that would not
/// block. A request that would fail (`ERANGE`) is admitted too; its retry
/// reports the error.
fn admit_semop(scratch: &mut Vec<u16>, id: IpcId, request: &WaitRequest, semvmx: u16) -> bool {
    let WaitRequest::Semop { id: waited, req } = request else {
        return false;
    };
    if *waited != id {
        return false;
    }
    let mut trial = scratch.clone();
    match simulate(&mut trial, &req.ops, semvmx) {
        Ok(None) => {
            *scratch = trial;
            true
        }
        Ok(Some(_)) => false,
        Err(_) => true,
    }
}

fn wake_semaphores(
    members: &mut Members<'_>,
    ns: &IpcNamespace,
    id: IpcId,
    semvmx: u16,
    host: &mut dyn Host,
) -> usize {
    let Ok(set) = ns.semaphores.lookup(id) else {
        return 0;
    };
    let mut scratch = set.values();

    for (_, tracee) in members.iter() {
        if let Some(request) = tracee.wait.pending_retry() {
            admit_semop(&mut scratch, id, request, semvmx);
        }
    }

    let mut woken = 0;
    for (pid, tracee) in members.iter_mut() {
        let admitted = tracee
            .wait
            .parked_request()
            .is_some_and(|r| admit_semop(&mut scratch, id, r, semvmx));
        if admitted && signal(*pid, &mut tracee.wait, None, host) {
            woken += 1;
        }
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::abi::{IpcPerm, Sembuf};
    use crate::ipc::msg::{Message, RecvRequest};
    use crate::ipc::sem::{SemSet, SemopRequest};
    use crate::ipc::wait::WaitState;
    use crate::tracee::Credentials;
    use core::time::Duration;
    use x86_64::VirtAddr;

    #[derive(Default)]
    struct Signals(Vec<Pid>);

    impl Host for Signals {
        fn send_wakeup(&mut self, pid: Pid) {
            self.0.push(pid);
        }

        fn realtime_secs(&self) -> i64 {
            0
        }

        fn monotonic(&self) -> Duration {
            Duration::ZERO
        }
    }

    fn parked(ns: &crate::ipc::SharedNamespace, request: WaitRequest) -> TraceeIpc {
        let mut tracee = TraceeIpc::new(ns.clone());
        tracee.wait.park(request, [0; 6]);
        tracee.wait.restart_into_ppoll();
        tracee.wait.enter_ppoll();
        tracee
    }

    fn recv(id: IpcId, msgtyp: i64) -> WaitRequest {
        WaitRequest::QueueRecv {
            id,
            req: RecvRequest { msgp: VirtAddr::new(0x1000), size: 64, msgtyp, flags: IpcFlags::empty() },
        }
    }

    fn decrement(id: IpcId) -> WaitRequest {
        WaitRequest::Semop {
            id,
            req: SemopRequest {
                ops: alloc::vec![Sembuf { sem_num: 0, sem_op: -1, sem_flg: 0 }],
                deadline: None,
                waiter: None,
            },
        }
    }

    fn perm() -> IpcPerm {
        IpcPerm::new(5, Credentials::default(), 0o600, 0)
    }

    #[test]
    fn one_message_wakes_one_receiver() {
        let shared = IpcNamespace::new_shared();
        let id = {
            let mut ns = shared.lock();
            let id = ns.queues.allocate(5, MsgQueue::new(perm(), 1024, 0)).unwrap();
            ns.queues.lookup_mut(id).unwrap().push(Message::new(7, alloc::vec![1, 2]), 1, 0);
            id
        };

        let mut tracees = BTreeMap::new();
        tracees.insert(10, parked(&shared, recv(id, 7)));
        tracees.insert(11, parked(&shared, recv(id, 7)));
        tracees.insert(12, parked(&shared, recv(id, 9)));

        let mut host = Signals::default();
        let ns = shared.lock();
        let woken = dispatch(&mut tracees, &ns, Wake::Queue(id), &IpcLimits::default(), &mut host);
        assert_eq!(woken, 1);
        assert_eq!(host.0, alloc::vec![10]);
        assert_eq!(tracees[&10].wait.state(), WaitState::SignaledPpoll);
        assert_eq!(tracees[&11].wait.state(), WaitState::EnteredPpoll);
        assert_eq!(tracees[&12].wait.state(), WaitState::EnteredPpoll);

        // a second pass must not hand the same message to pid 11
        assert_eq!(dispatch(&mut tracees, &ns, Wake::Queue(id), &IpcLimits::default(), &mut host), 0);
    }

    #[test]
    fn semaphore_units_are_shared_out() {
        let shared = IpcNamespace::new_shared();
        let id = shared.lock().semaphores.allocate(5, SemSet::new(perm(), 1, 0).unwrap()).unwrap();
        let mut tracees = BTreeMap::new();
        tracees.insert(20, parked(&shared, decrement(id)));
        tracees.insert(21, parked(&shared, decrement(id)));

        let mut host = Signals::default();
        let limits = IpcLimits::default();
        let mut ns = shared.lock();
        assert_eq!(dispatch(&mut tracees, &ns, Wake::Semaphores(id), &limits, &mut host), 0);

        // one unit becomes available: the lower pid gets it
        crate::ipc::sem::apply_undo(&mut ns, id, &[1], 1, limits.semvmx);
        assert_eq!(dispatch(&mut tracees, &ns, Wake::Semaphores(id), &limits, &mut host), 1);
        assert_eq!(host.0, alloc::vec![20]);
        assert_eq!(tracees[&21].wait.state(), WaitState::EnteredPpoll);
    }

    #[test]
    fn removal_fails_only_matching_kind() {
        let shared = IpcNamespace::new_shared();
        let (qid, sid) = {
            let mut ns = shared.lock();
            let qid = ns.queues.allocate(5, MsgQueue::new(perm(), 1024, 0)).unwrap();
            let sid = ns.semaphores.allocate(5, SemSet::new(perm(), 1, 0).unwrap()).unwrap();
            (qid, sid)
        };
        // both objects sit in slot 0 and share the numeric id
        assert_eq!(qid, sid);

        let mut tracees = BTreeMap::new();
        tracees.insert(30, parked(&shared, recv(qid, 0)));
        tracees.insert(31, parked(&shared, decrement(sid)));

        let mut host = Signals::default();
        let ns = shared.lock();
        let woken = dispatch(&mut tracees, &ns, Wake::QueueRemoved(qid), &IpcLimits::default(), &mut host);
        assert_eq!(woken, 1);
        assert_eq!(host.0, alloc::vec![30]);
        assert_eq!(tracees[&31].wait.state(), WaitState::EnteredPpoll);
    }

    #[test]
    fn other_namespaces_are_left_alone() {
        let ours = IpcNamespace::new_shared();
        let theirs = IpcNamespace::new_shared();
        let id = {
            let mut ns = ours.lock();
            let id = ns.queues.allocate(5, MsgQueue::new(perm(), 1024, 0)).unwrap();
            ns.queues.lookup_mut(id).unwrap().push(Message::new(1, alloc::vec![0]), 1, 0);
            id
        };
        let mut tracees = BTreeMap::new();
        tracees.insert(40, parked(&theirs, recv(id, 0)));

        let mut host = Signals::default();
        let ns = ours.lock();
        assert_eq!(dispatch(&mut tracees, &ns, Wake::Queue(id), &IpcLimits::default(), &mut host), 0);
        assert!(host.0.is_empty());
    }
}
