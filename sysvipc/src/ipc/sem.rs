//! System V Semaphore Sets
//!
//! Emulation of semget, semop, semtimedop and semctl:
//! - multiple semaphores per set
//! - atomic multi-semaphore operations (all or nothing)
//! - blocking with optional timeout
//! - undo on tracee exit (SEM_UNDO)

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use log::{debug, trace};

use super::abi::{
    decode_timespec, IpcPerm, SemidDs, Sembuf, IPC_64, SEMBUF_SIZE, SEMID_DS_SIZE, TIMESPEC_SIZE,
};
use super::namespace::IpcNamespace;
use super::slots::IpcId;
use super::wait::WaitRequest;
use super::{Call, Completion, IpcFlags, Wake, IPC_PRIVATE, IPC_RMID, IPC_SET, IPC_STAT};
use crate::tracee::{user_addr, Pid};
use crate::util::{IpcError, IpcResult};

// Default limits
pub const SEMMSL: usize = 32000;   // Max semaphores per set
pub const SEMOPM: usize = 500;     // Max operations per semop call
pub const SEMVMX: u16 = 32767;     // Max semaphore value

/// semctl commands
pub const GETPID: i32 = 11;
pub const GETVAL: i32 = 12;
pub const GETALL: i32 = 13;
pub const GETNCNT: i32 = 14;
pub const GETZCNT: i32 = 15;
pub const SETVAL: i32 = 16;
pub const SETALL: i32 = 17;

bitflags::bitflags! {
    /// `sem_flg` bits of a `struct sembuf`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SemOpFlags: i16 {
        const IPC_NOWAIT = 0o4000;
        const SEM_UNDO   = 0x1000;
    }
}

fn op_flags(op: &Sembuf) -> SemOpFlags {
    SemOpFlags::from_bits_truncate(op.sem_flg)
}

/// Single semaphore within a set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Semaphore {
    pub value: u16,
    /// Tracees waiting for the value to increase
    pub ncnt: u32,
    /// Tracees waiting for the value to become zero
    pub zcnt: u32,
    /// PID of the last tracee that changed the value
    pub pid: Pid,
}

/// What a blocked operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Increase,
    Zero,
}

/// The `semncnt`/`semzcnt` entry a blocked semop is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemWaiter {
    pub sem_num: u16,
    pub kind: WaitKind,
}

/// Saved `semop`/`semtimedop` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemopRequest {
    pub ops: Vec<Sembuf>,
    /// Monotonic deadline of a semtimedop.
    pub deadline: Option<Duration>,
    /// Set while the request is counted as a waiter.
    pub waiter: Option<SemWaiter>,
}

/// Applies `ops` in order to `values`.
///
/// Returns `Ok(None)` when every operation succeeded (and `values` holds the
/// result), or `Ok(Some(i))` when operation `i` would block; `values` is then
/// partially updated and must be discarded.
pub fn simulate(values: &mut [u16], ops: &[Sembuf], semvmx: u16) -> IpcResult<Option<usize>> {
    for (i, op) in ops.iter().enumerate() {
        let value = values.get_mut(op.sem_num as usize).ok_or(IpcError::SemaphoreIndex)?;
        if op.sem_op == 0 {
            if *value != 0 {
                return Ok(Some(i));
            }
            continue;
        }
        let result = i32::from(*value) + i32::from(op.sem_op);
        if result < 0 {
            return Ok(Some(i));
        }
        if result > i32::from(semvmx) {
            return Err(IpcError::OutOfRange);
        }
        *value = result as u16;
    }
    Ok(None)
}

/// Semaphore set
pub struct SemSet {
    ds: SemidDs,
    sems: Vec<Semaphore>,
}

impl SemSet {
    pub fn new(perm: IpcPerm, nsems: usize, now: i64) -> IpcResult<Self> {
        let mut sems = Vec::new();
        sems.try_reserve_exact(nsems).map_err(|_| IpcError::NoMemory)?;
        sems.resize(nsems, Semaphore::default());
        Ok(Self {
            ds: SemidDs { perm, otime: 0, ctime: now, nsems: nsems as u64 },
            sems,
        })
    }

    pub fn nsems(&self) -> usize {
        self.sems.len()
    }

    pub fn stat(&self) -> &SemidDs {
        &self.ds
    }

    pub fn semaphore(&self, sem_num: i32) -> IpcResult<&Semaphore> {
        usize::try_from(sem_num)
            .ok()
            .and_then(|n| self.sems.get(n))
            .ok_or(IpcError::Invalid)
    }

    pub fn values(&self) -> Vec<u16> {
        self.sems.iter().map(|s| s.value).collect()
    }

    /// Installs the outcome of a successful [`simulate`].
    fn commit(&mut self, values: &[u16], ops: &[Sembuf], pid: Pid, now: i64) {
        for (sem, &value) in self.sems.iter_mut().zip(values) {
            sem.value = value;
        }
        for op in ops {
            self.sems[op.sem_num as usize].pid = pid;
        }
        self.ds.otime = now;
    }

    fn set_value(&mut self, sem_num: usize, value: u16, pid: Pid, now: i64) {
        let sem = &mut self.sems[sem_num];
        sem.value = value;
        sem.pid = pid;
        self.ds.ctime = now;
    }

    pub fn add_waiter(&mut self, waiter: SemWaiter) {
        if let Some(sem) = self.sems.get_mut(waiter.sem_num as usize) {
            match waiter.kind {
                WaitKind::Increase => sem.ncnt += 1,
                WaitKind::Zero => sem.zcnt += 1,
            }
        }
    }

    pub fn remove_waiter(&mut self, waiter: SemWaiter) {
        if let Some(sem) = self.sems.get_mut(waiter.sem_num as usize) {
            match waiter.kind {
                WaitKind::Increase => sem.ncnt = sem.ncnt.saturating_sub(1),
                WaitKind::Zero => sem.zcnt = sem.zcnt.saturating_sub(1),
            }
        }
    }
}

// ============================================================================
// SEM_UNDO support
// ============================================================================

/// Per-tracee adjustments reverted when the tracee goes away.
///
/// For every successful operation carrying `SEM_UNDO` the negated delta is
/// accumulated here, keyed by set identifier and semaphore number.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UndoList {
    entries: BTreeMap<IpcId, Vec<i32>>,
}

impl UndoList {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, id: IpcId, nsems: usize, ops: &[Sembuf]) {
        for op in ops.iter().filter(|op| op_flags(op).contains(SemOpFlags::SEM_UNDO)) {
            if op.sem_op == 0 {
                continue;
            }
            let adj = self.entries.entry(id).or_insert_with(|| vec![0; nsems]);
            if let Some(slot) = adj.get_mut(op.sem_num as usize) {
                *slot -= i32::from(op.sem_op);
            }
        }
    }

    /// Current adjustment of one semaphore.
    #[cfg(test)]
    pub fn adjustment(&self, id: IpcId, sem_num: usize) -> i32 {
        self.entries.get(&id).and_then(|adj| adj.get(sem_num)).copied().unwrap_or(0)
    }

    /// Drops adjustments after `SETVAL` (one semaphore) or `SETALL` (all).
    pub fn clear(&mut self, id: IpcId, sem_num: Option<u16>) {
        match sem_num {
            None => {
                self.entries.remove(&id);
            }
            Some(n) => {
                if let Some(slot) = self.entries.get_mut(&id).and_then(|adj| adj.get_mut(n as usize)) {
                    *slot = 0;
                }
            }
        }
    }

    pub fn take(&mut self) -> BTreeMap<IpcId, Vec<i32>> {
        core::mem::take(&mut self.entries)
    }
}

/// Applies an exiting tracee's adjustments to set `id`.
///
/// Values are clamped to `0..=semvmx`; `sem_ctime` is left alone, as on
/// Linux. Returns `false` if the set is gone.
pub(crate) fn apply_undo(ns: &mut IpcNamespace, id: IpcId, adj: &[i32], pid: Pid, semvmx: u16) -> bool {
    let Ok(set) = ns.semaphores.lookup_mut(id) else {
        return false;
    };
    for (sem, &delta) in set.sems.iter_mut().zip(adj).filter(|(_, d)| **d != 0) {
        sem.value = (i32::from(sem.value) + delta).clamp(0, i32::from(semvmx)) as u16;
        sem.pid = pid;
    }
    true
}

/// Gives back the `semncnt`/`semzcnt` count held by a parked request.
pub(crate) fn release_waiter(ns: &mut IpcNamespace, id: IpcId, req: &SemopRequest) {
    if let (Some(waiter), Ok(set)) = (req.waiter, ns.semaphores.lookup_mut(id)) {
        set.remove_waiter(waiter);
    }
}

// ============================================================================
// Syscall handlers
// ============================================================================

/// semget - get a semaphore set identifier
pub(crate) fn sys_semget(call: &mut Call<'_>, key: i32, nsems: i32, semflg: i32) -> IpcResult<Completion> {
    let flags = IpcFlags::from_bits_truncate(semflg);
    let nsems = usize::try_from(nsems).map_err(|_| IpcError::Invalid)?;
    if nsems > call.limits.semmsl {
        return Err(IpcError::Invalid);
    }

    if key != IPC_PRIVATE {
        if let Some(id) = call.ns.semaphores.find_key(key) {
            if flags.contains(IpcFlags::IPC_CREAT | IpcFlags::IPC_EXCL) {
                return Err(IpcError::AlreadyExists);
            }
            if nsems > call.ns.semaphores.lookup(id)?.nsems() {
                return Err(IpcError::Invalid);
            }
            return Ok(Completion::Done(id.raw().into()));
        }
        if !flags.contains(IpcFlags::IPC_CREAT) {
            return Err(IpcError::NotFound);
        }
    }

    if nsems == 0 {
        return Err(IpcError::Invalid);
    }

    let perm = IpcPerm::new(key, call.tracee.credentials(), semflg, 0);
    let set = SemSet::new(perm, nsems, call.now)?;
    let id = call.ns.semaphores.allocate(key, set)?;
    call.ns.semaphores.lookup_mut(id)?.ds.perm.seq = id.generation();

    debug!("sysvipc: semget key={:#x} created {:?} ({} sems) in {:?}", key, id, nsems, call.ns.id());
    Ok(Completion::Done(id.raw().into()))
}

/// semop / semtimedop - atomic operations on a semaphore set
pub(crate) fn sys_semop(
    call: &mut Call<'_>,
    semid: i32,
    sops: u64,
    nsops: u64,
    timeout: Option<u64>,
) -> IpcResult<Completion> {
    let nsops = usize::try_from(nsops).map_err(|_| IpcError::Invalid)?;
    if nsops == 0 {
        return Err(IpcError::Invalid);
    }
    if nsops > call.limits.semopm {
        return Err(IpcError::TooBig);
    }

    let raw = call.tracee.read_vec(user_addr(sops)?, nsops * SEMBUF_SIZE)?;
    let ops: Vec<Sembuf> = raw.chunks_exact(SEMBUF_SIZE).map(Sembuf::decode).collect();

    let deadline = match timeout {
        Some(ptr) => {
            let mut ts = [0u8; TIMESPEC_SIZE];
            call.tracee.read_memory(user_addr(ptr)?, &mut ts)?;
            Some(call.monotonic + decode_timespec(&ts)?)
        }
        None => None,
    };

    semop(call, IpcId::from_raw(semid), SemopRequest { ops, deadline, waiter: None })
}

/// Applies the batch atomically, or blocks on its first failing operation.
pub(crate) fn semop(call: &mut Call<'_>, id: IpcId, mut req: SemopRequest) -> IpcResult<Completion> {
    let pid = call.tracee.pid();
    let semvmx = call.limits.semvmx;
    let set = call.ns.semaphores.lookup_mut(id)?;
    req.waiter = None;

    if req.ops.iter().any(|op| op.sem_num as usize >= set.nsems()) {
        return Err(IpcError::SemaphoreIndex);
    }

    let mut values = set.values();
    let Some(blocked) = simulate(&mut values, &req.ops, semvmx)? else {
        set.commit(&values, &req.ops, pid, call.now);
        let nsems = set.nsems();
        call.undo.record(id, nsems, &req.ops);
        call.wake = Some(Wake::Semaphores(id));
        trace!("sysvipc: semop {:?} applied {} ops", id, req.ops.len());
        return Ok(Completion::Done(0));
    };

    let op = req.ops[blocked];
    if op_flags(&op).contains(SemOpFlags::IPC_NOWAIT) {
        return Err(IpcError::WouldBlock);
    }
    if req.deadline.is_some_and(|d| d <= call.monotonic) {
        return Err(IpcError::WouldBlock);
    }

    let kind = if op.sem_op == 0 { WaitKind::Zero } else { WaitKind::Increase };
    let waiter = SemWaiter { sem_num: op.sem_num, kind };
    set.add_waiter(waiter);
    req.waiter = Some(waiter);
    trace!("sysvipc: semop {:?} blocks on sem {} ({:?})", id, op.sem_num, kind);
    Ok(Completion::Block(WaitRequest::Semop { id, req }))
}

/// semctl - control operations on a semaphore set
pub(crate) fn sys_semctl(
    call: &mut Call<'_>,
    semid: i32,
    semnum: i32,
    cmd: i32,
    arg: u64,
) -> IpcResult<Completion> {
    let id = IpcId::from_raw(semid);
    let pid = call.tracee.pid();
    let semvmx = call.limits.semvmx;

    match cmd & !IPC_64 {
        IPC_RMID => {
            call.ns.semaphores.remove(id)?;
            debug!("sysvipc: semctl removed {:?}", id);
            call.wake = Some(Wake::SemaphoresRemoved(id));
            Ok(Completion::Done(0))
        }

        IPC_STAT => {
            let ds = call.ns.semaphores.lookup(id)?.stat().encode();
            call.tracee.write_memory(user_addr(arg)?, &ds)?;
            Ok(Completion::Done(0))
        }

        IPC_SET => {
            call.ns.semaphores.lookup(id)?;
            let raw = call.tracee.read_vec(user_addr(arg)?, SEMID_DS_SIZE)?;
            let set = call.ns.semaphores.lookup_mut(id)?;
            set.ds.perm.update_from(&raw);
            set.ds.ctime = call.now;
            Ok(Completion::Done(0))
        }

        GETVAL => Ok(Completion::Done(call.ns.semaphores.lookup(id)?.semaphore(semnum)?.value.into())),
        GETPID => Ok(Completion::Done(call.ns.semaphores.lookup(id)?.semaphore(semnum)?.pid.into())),
        GETNCNT => Ok(Completion::Done(call.ns.semaphores.lookup(id)?.semaphore(semnum)?.ncnt.into())),
        GETZCNT => Ok(Completion::Done(call.ns.semaphores.lookup(id)?.semaphore(semnum)?.zcnt.into())),

        GETALL => {
            let raw: Vec<u8> = call
                .ns
                .semaphores
                .lookup(id)?
                .values()
                .iter()
                .flat_map(|v| v.to_ne_bytes())
                .collect();
            call.tracee.write_memory(user_addr(arg)?, &raw)?;
            Ok(Completion::Done(0))
        }

        SETVAL => {
            let set = call.ns.semaphores.lookup_mut(id)?;
            set.semaphore(semnum)?;
            // union semun passes `int val` in the low half
            let value = arg as i32;
            if !(0..=i32::from(semvmx)).contains(&value) {
                return Err(IpcError::OutOfRange);
            }
            set.set_value(semnum as usize, value as u16, pid, call.now);
            call.wake = Some(Wake::SemaphoresReset { id, sem_num: Some(semnum as u16) });
            Ok(Completion::Done(0))
        }

        SETALL => {
            let nsems = call.ns.semaphores.lookup(id)?.nsems();
            let raw = call.tracee.read_vec(user_addr(arg)?, nsems * 2)?;
            let values: Vec<u16> = raw.chunks_exact(2).map(|b| u16::from_ne_bytes([b[0], b[1]])).collect();
            if values.iter().any(|&v| v > semvmx) {
                return Err(IpcError::OutOfRange);
            }
            let set = call.ns.semaphores.lookup_mut(id)?;
            for (sem_num, &value) in values.iter().enumerate() {
                set.set_value(sem_num, value, pid, call.now);
            }
            call.wake = Some(Wake::SemaphoresReset { id, sem_num: None });
            Ok(Completion::Done(0))
        }

        _ => Err(IpcError::Invalid),
    }
}
