//! Scripted tracer for driving `SysVIpc` through the stops a real tracer
//! would report.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use sysvipc::syscall::nr;
use sysvipc::{
    Credentials, Host, IpcError, IpcLimits, IpcResult, Membership, Pid, SignalDisposition,
    SignalKind, StopAction, SysVIpc, TraceeContext, WaitState,
};
use x86_64::VirtAddr;

/// Start of every mock tracee's memory window.
pub const BASE: u64 = 0x10000;
const MEMORY_SIZE: usize = 0x4000;

/// Scratch buffers inside the window.
pub const MSG_BUF: u64 = BASE;
pub const RECV_BUF: u64 = BASE + 0x1000;
pub const SOPS_BUF: u64 = BASE + 0x2000;
pub const TIMESPEC_BUF: u64 = BASE + 0x2800;
pub const DS_BUF: u64 = BASE + 0x3000;

pub const IPC_CREAT: i32 = 0o1000;
pub const IPC_EXCL: i32 = 0o2000;
pub const IPC_NOWAIT: i32 = 0o4000;
pub const MSG_NOERROR: i32 = 0o10000;
pub const MSG_EXCEPT: i32 = 0o20000;
pub const MSG_COPY: i32 = 0o40000;
pub const SEM_UNDO: i16 = 0x1000;

pub const IPC_RMID: i32 = 0;
pub const IPC_SET: i32 = 1;
pub const IPC_STAT: i32 = 2;
pub const GETPID: i32 = 11;
pub const GETVAL: i32 = 12;
pub const GETALL: i32 = 13;
pub const GETNCNT: i32 = 14;
pub const GETZCNT: i32 = 15;
pub const SETVAL: i32 = 16;
pub const SETALL: i32 = 17;

pub const EINTR: i64 = -4;
pub const E2BIG: i64 = -7;
pub const EAGAIN: i64 = -11;
pub const EFAULT: i64 = -14;
pub const EEXIST: i64 = -17;
pub const EINVAL: i64 = -22;
pub const ENOENT: i64 = -2;
pub const EFBIG: i64 = -27;
pub const ERANGE: i64 = -34;
pub const ENOMSG: i64 = -42;
pub const EIDRM: i64 = -43;
pub const EMSGSIZE: i64 = -90;

/// Return value the kernel leaves in rax when a signal interrupts ppoll.
const ERESTARTNOHAND: i64 = -514;

pub struct MockTracee {
    pid: Pid,
    pub nr: u64,
    pub args: [u64; 6],
    pub ret: Option<i64>,
    pub restarts: usize,
    memory: Vec<u8>,
}

impl MockTracee {
    fn new(pid: Pid) -> Self {
        Self { pid, nr: 0, args: [0; 6], ret: None, restarts: 0, memory: vec![0; MEMORY_SIZE] }
    }

    fn range(&self, addr: VirtAddr, len: usize) -> IpcResult<std::ops::Range<usize>> {
        let start = addr.as_u64().checked_sub(BASE).ok_or(IpcError::Fault)? as usize;
        let end = start.checked_add(len).ok_or(IpcError::Fault)?;
        if end > self.memory.len() {
            return Err(IpcError::Fault);
        }
        Ok(start..end)
    }
}

impl TraceeContext for MockTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn credentials(&self) -> Credentials {
        Credentials { uid: 1000, gid: 1000 }
    }

    fn syscall_number(&self) -> u64 {
        self.nr
    }

    fn syscall_arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    fn set_syscall_number(&mut self, nr: u64) {
        self.nr = nr;
    }

    fn set_syscall_arg(&mut self, index: usize, value: u64) {
        self.args[index] = value;
    }

    fn set_return_value(&mut self, value: i64) {
        self.ret = Some(value);
    }

    fn restart_syscall(&mut self, nr: u64, args: [u64; 6]) {
        self.nr = nr;
        self.args = args;
        self.restarts += 1;
    }

    fn read_memory(&self, addr: VirtAddr, buf: &mut [u8]) -> IpcResult<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn write_memory(&mut self, addr: VirtAddr, data: &[u8]) -> IpcResult<()> {
        let range = self.range(addr, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockHost {
    pub wakeups: Vec<Pid>,
    pub realtime: i64,
    pub monotonic: Duration,
}

impl Host for MockHost {
    fn send_wakeup(&mut self, pid: Pid) {
        self.wakeups.push(pid);
    }

    fn realtime_secs(&self) -> i64 {
        self.realtime
    }

    fn monotonic(&self) -> Duration {
        self.monotonic
    }
}

/// How a full syscall ended from the tracee's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done(i64),
    /// Sleeping in ppoll.
    Blocked,
}

pub struct Harness {
    pub ipc: SysVIpc,
    pub host: MockHost,
    tracees: BTreeMap<Pid, MockTracee>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limits(IpcLimits::default())
    }

    pub fn with_limits(limits: IpcLimits) -> Self {
        Self { ipc: SysVIpc::with_limits(limits), host: MockHost::default(), tracees: BTreeMap::new() }
    }

    /// `pids` share one namespace.
    pub fn sharing(pids: &[Pid]) -> Self {
        let mut h = Self::new();
        h.spawn(pids[0], Membership::New);
        for &pid in &pids[1..] {
            h.spawn(pid, Membership::ShareWith(pids[0]));
        }
        h
    }

    pub fn spawn(&mut self, pid: Pid, membership: Membership) {
        self.ipc.attach(pid, membership);
        self.tracees.insert(pid, MockTracee::new(pid));
    }

    /// A tracee the emulation has not been told about.
    pub fn spawn_unattached(&mut self, pid: Pid) {
        self.tracees.insert(pid, MockTracee::new(pid));
    }

    pub fn exit(&mut self, pid: Pid) {
        self.tracees.remove(&pid);
        self.ipc.detach(pid, &mut self.host);
    }

    pub fn tracee(&self, pid: Pid) -> &MockTracee {
        &self.tracees[&pid]
    }

    pub fn state(&self, pid: Pid) -> WaitState {
        self.ipc.wait_state(pid).expect("tracee attached")
    }

    pub fn take_wakeups(&mut self) -> Vec<Pid> {
        std::mem::take(&mut self.host.wakeups)
    }

    // ===== Single stops =====

    pub fn enter(&mut self, pid: Pid, nr: u64, args: [u64; 6]) -> StopAction {
        let tracee = self.tracees.get_mut(&pid).expect("tracee exists");
        tracee.nr = nr;
        tracee.args = args;
        tracee.ret = None;
        self.ipc.on_syscall_enter(tracee, &mut self.host)
    }

    /// Entry of the ppoll the tracee was rewound into.
    pub fn enter_ppoll(&mut self, pid: Pid) -> StopAction {
        let tracee = self.tracees.get_mut(&pid).expect("tracee exists");
        assert_eq!(tracee.nr, nr::PPOLL, "tracee was not rewound into ppoll");
        self.ipc.on_syscall_enter(tracee, &mut self.host)
    }

    pub fn exit_stop(&mut self, pid: Pid) -> StopAction {
        let tracee = self.tracees.get_mut(&pid).expect("tracee exists");
        self.ipc.on_syscall_exit(tracee, &mut self.host)
    }

    pub fn signal(&mut self, pid: Pid, kind: SignalKind) -> SignalDisposition {
        self.ipc.on_signal(pid, kind)
    }

    // ===== Whole syscalls =====

    /// Runs one syscall from entry to its result or until it sleeps.
    pub fn syscall(&mut self, pid: Pid, nr: u64, args: [u64; 6]) -> Outcome {
        let action = self.enter(pid, nr, args);
        assert_ne!(action, StopAction::Ignored, "syscall {} was not intercepted", nr);
        self.run_to_exit(pid)
    }

    /// The kernel ran the current syscall (the substituted getpid, or a
    /// ppoll that just ended) up to its exit stop.
    fn run_to_exit(&mut self, pid: Pid) -> Outcome {
        loop {
            match self.exit_stop(pid) {
                StopAction::Emulated => {
                    let ret = self.tracees[&pid].ret.expect("return value injected");
                    return Outcome::Done(ret);
                }
                StopAction::Parked => match self.enter_ppoll(pid) {
                    StopAction::Parked => return Outcome::Blocked,
                    // neutralised into getpid: runs straight to its exit
                    StopAction::Emulated => continue,
                    StopAction::Ignored => panic!("ppoll entry ignored"),
                },
                StopAction::Ignored => panic!("exit stop of pid {} ignored", pid),
            }
        }
    }

    /// Delivers a pending wakeup: ppoll ends, then the signal stop is
    /// reported and suppressed.
    pub fn deliver_wakeup(&mut self, pid: Pid) -> Outcome {
        let pos = self.host.wakeups.iter().position(|&p| p == pid).expect("wakeup was sent");
        self.host.wakeups.remove(pos);
        self.tracees.get_mut(&pid).expect("tracee exists").ret = Some(ERESTARTNOHAND);
        let outcome = self.run_to_exit(pid);
        assert_eq!(self.signal(pid, SignalKind::Wakeup), SignalDisposition::Suppress);
        outcome
    }

    /// A foreign signal hits a tracee sleeping in ppoll.
    pub fn interrupt(&mut self, pid: Pid) -> Outcome {
        assert_eq!(self.signal(pid, SignalKind::External), SignalDisposition::Deliver);
        self.tracees.get_mut(&pid).expect("tracee exists").ret = Some(ERESTARTNOHAND);
        self.run_to_exit(pid)
    }

    /// Runs `f` as a signal handler of `pid`: the interrupted registers are
    /// saved in the signal frame and put back by sigreturn.
    pub fn in_handler<R>(&mut self, pid: Pid, f: impl FnOnce(&mut Self) -> R) -> R {
        let t = &self.tracees[&pid];
        let frame = (t.nr, t.args, t.ret);
        let result = f(self);
        let t = self.tracees.get_mut(&pid).expect("tracee exists");
        (t.nr, t.args, t.ret) = frame;
        result
    }

    // ===== Memory =====

    pub fn write(&mut self, pid: Pid, addr: u64, data: &[u8]) {
        let tracee = self.tracees.get_mut(&pid).expect("tracee exists");
        tracee.write_memory(VirtAddr::new(addr), data).expect("address in window");
    }

    pub fn read(&self, pid: Pid, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.tracees[&pid].read_memory(VirtAddr::new(addr), &mut buf).expect("address in window");
        buf
    }

    /// Lays out `struct msgbuf { long mtype; char mtext[]; }` at `addr`.
    pub fn put_message(&mut self, pid: Pid, addr: u64, mtype: i64, text: &[u8]) {
        self.write(pid, addr, &mtype.to_ne_bytes());
        self.write(pid, addr + 8, text);
    }

    pub fn get_message(&self, pid: Pid, addr: u64, len: usize) -> (i64, Vec<u8>) {
        let raw = self.read(pid, addr, 8 + len);
        let mut mtype = [0u8; 8];
        mtype.copy_from_slice(&raw[..8]);
        (i64::from_ne_bytes(mtype), raw[8..].to_vec())
    }

    pub fn put_sembufs(&mut self, pid: Pid, ops: &[(u16, i16, i16)]) {
        let raw: Vec<u8> = ops
            .iter()
            .flat_map(|&(num, op, flg)| {
                let mut b = [0u8; 6];
                b[0..2].copy_from_slice(&num.to_ne_bytes());
                b[2..4].copy_from_slice(&op.to_ne_bytes());
                b[4..6].copy_from_slice(&flg.to_ne_bytes());
                b
            })
            .collect();
        self.write(pid, SOPS_BUF, &raw);
    }

    pub fn put_timespec(&mut self, pid: Pid, timeout: Duration) {
        self.write(pid, TIMESPEC_BUF, &(timeout.as_secs() as i64).to_ne_bytes());
        self.write(pid, TIMESPEC_BUF + 8, &i64::from(timeout.subsec_nanos()).to_ne_bytes());
    }

    // ===== IPC syscalls =====

    pub fn msgget(&mut self, pid: Pid, key: i32, flags: i32) -> Outcome {
        self.syscall(pid, nr::MSGGET, [int(key), int(flags), 0, 0, 0, 0])
    }

    /// Sends `text` with type `mtype` from the tracee's message buffer.
    pub fn msgsnd(&mut self, pid: Pid, id: i64, mtype: i64, text: &[u8], flags: i32) -> Outcome {
        self.put_message(pid, MSG_BUF, mtype, text);
        self.syscall(pid, nr::MSGSND, [id as u64, MSG_BUF, text.len() as u64, int(flags), 0, 0])
    }

    pub fn msgrcv(&mut self, pid: Pid, id: i64, size: usize, msgtyp: i64, flags: i32) -> Outcome {
        self.syscall(pid, nr::MSGRCV, [id as u64, RECV_BUF, size as u64, msgtyp as u64, int(flags), 0])
    }

    pub fn msgctl(&mut self, pid: Pid, id: i64, cmd: i32, buf: u64) -> Outcome {
        self.syscall(pid, nr::MSGCTL, [id as u64, int(cmd), buf, 0, 0, 0])
    }

    pub fn semget(&mut self, pid: Pid, key: i32, nsems: i32, flags: i32) -> Outcome {
        self.syscall(pid, nr::SEMGET, [int(key), int(nsems), int(flags), 0, 0, 0])
    }

    pub fn semop(&mut self, pid: Pid, id: i64, ops: &[(u16, i16, i16)]) -> Outcome {
        self.put_sembufs(pid, ops);
        self.syscall(pid, nr::SEMOP, [id as u64, SOPS_BUF, ops.len() as u64, 0, 0, 0])
    }

    pub fn semtimedop(&mut self, pid: Pid, id: i64, ops: &[(u16, i16, i16)], timeout: Duration) -> Outcome {
        self.put_sembufs(pid, ops);
        self.put_timespec(pid, timeout);
        self.syscall(pid, nr::SEMTIMEDOP, [id as u64, SOPS_BUF, ops.len() as u64, TIMESPEC_BUF, 0, 0])
    }

    pub fn semctl(&mut self, pid: Pid, id: i64, semnum: i32, cmd: i32, arg: u64) -> Outcome {
        self.syscall(pid, nr::SEMCTL, [id as u64, int(semnum), int(cmd), arg, 0, 0])
    }
}

/// Sign-extends an `int` argument into its register.
pub fn int(v: i32) -> u64 {
    i64::from(v) as u64
}

/// Unwraps a completed syscall.
pub fn done(outcome: Outcome) -> i64 {
    match outcome {
        Outcome::Done(v) => v,
        Outcome::Blocked => panic!("syscall blocked"),
    }
}
