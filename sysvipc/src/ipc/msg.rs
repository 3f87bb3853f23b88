//! System V Message Queues
//!
//! Emulation of msgget, msgsnd, msgrcv and msgctl. Messages carry a type
//! (positive long) and a byte body; each queue keeps them in send order.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::{debug, trace};
use x86_64::VirtAddr;

use super::abi::{IpcPerm, MsqidDs, IPC_64, MSQID_DS_SIZE};
use super::slots::IpcId;
use super::wait::WaitRequest;
use super::{Call, Completion, IpcFlags, Wake, IPC_PRIVATE, IPC_RMID, IPC_SET, IPC_STAT};
use crate::tracee::{offset_addr, read_i64, user_addr};
use crate::util::{IpcError, IpcResult};

// Default limits
pub const MSGMAX: usize = 8192;        // Max message size
pub const MSGMNB: usize = 16384;       // Max queue size in bytes

/// Size of the `mtype` header in front of the message text.
const MTYPE_SIZE: u64 = 8;

/// Message in the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type (must be > 0)
    pub mtype: i64,
    /// Message data
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(mtype: i64, data: Vec<u8>) -> Self {
        Self { mtype, data }
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Saved `msgrcv` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub msgp: VirtAddr,
    pub size: usize,
    pub msgtyp: i64,
    pub flags: IpcFlags,
}

/// Saved `msgsnd` arguments, with the message already copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub message: Message,
    pub flags: IpcFlags,
}

/// A message queue
pub struct MsgQueue {
    ds: MsqidDs,
    messages: VecDeque<Message>,
}

impl MsgQueue {
    pub fn new(perm: IpcPerm, qbytes: usize, now: i64) -> Self {
        Self {
            ds: MsqidDs {
                perm,
                stime: 0,
                rtime: 0,
                ctime: now,
                cbytes: 0,
                qnum: 0,
                qbytes: qbytes as u64,
                lspid: 0,
                lrpid: 0,
            },
            messages: VecDeque::new(),
        }
    }

    /// Kernel-visible statistics.
    pub fn stat(&self) -> &MsqidDs {
        &self.ds
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Bytes currently queued.
    pub fn bytes(&self) -> usize {
        self.ds.cbytes as usize
    }

    /// Whether a message of `size` bytes fits next to `bytes` queued bytes
    /// and `count` queued messages.
    pub fn fits(&self, bytes: usize, count: usize, size: usize) -> bool {
        let qbytes = self.ds.qbytes as usize;
        bytes + size <= qbytes && count < qbytes
    }

    fn refresh_counts(&mut self) {
        self.ds.cbytes = self.messages.iter().map(|m| m.size() as u64).sum();
        self.ds.qnum = self.messages.len() as u64;
    }

    /// Appends a message at the tail.
    pub fn push(&mut self, msg: Message, pid: i32, now: i64) {
        self.messages.push_back(msg);
        self.refresh_counts();
        self.ds.stime = now;
        self.ds.lspid = pid;
    }

    /// Position of the message a receive would take, skipping positions in
    /// `claimed`.
    ///
    /// - msgtyp == 0: first message
    /// - msgtyp > 0: first message of type msgtyp (any other type with `MSG_EXCEPT`)
    /// - msgtyp < 0: first message with the lowest type <= |msgtyp|
    /// - `MSG_COPY`: the message at position msgtyp
    pub fn select(&self, msgtyp: i64, flags: IpcFlags, claimed: &[usize]) -> Option<usize> {
        let mut candidates = self
            .messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed.contains(i));

        if flags.contains(IpcFlags::MSG_COPY) {
            let position = usize::try_from(msgtyp).ok()?;
            return (position < self.messages.len()).then_some(position);
        }

        if msgtyp == 0 {
            candidates.next().map(|(i, _)| i)
        } else if msgtyp > 0 {
            if flags.contains(IpcFlags::MSG_EXCEPT) {
                candidates.find(|(_, m)| m.mtype != msgtyp).map(|(i, _)| i)
            } else {
                candidates.find(|(_, m)| m.mtype == msgtyp).map(|(i, _)| i)
            }
        } else {
            let limit = msgtyp.unsigned_abs();
            let mut best: Option<(usize, i64)> = None;
            for (i, m) in candidates {
                if m.mtype as u64 <= limit && best.map_or(true, |(_, t)| m.mtype < t) {
                    best = Some((i, m.mtype));
                }
            }
            best.map(|(i, _)| i)
        }
    }

    pub fn get(&self, position: usize) -> Option<&Message> {
        self.messages.get(position)
    }

    /// Removes the message at `position`.
    pub fn take(&mut self, position: usize, pid: i32, now: i64) -> Option<Message> {
        let msg = self.messages.remove(position)?;
        self.refresh_counts();
        self.ds.rtime = now;
        self.ds.lrpid = pid;
        Some(msg)
    }

    /// `IPC_SET`: owner, mode and byte quota.
    pub fn set(&mut self, buf: &[u8], now: i64) {
        self.ds.perm.update_from(buf);
        self.ds.qbytes = MsqidDs::qbytes_of(buf);
        self.ds.ctime = now;
    }
}

// ============================================================================
// Syscall handlers
// ============================================================================

/// msgget - get a message queue identifier
///
/// `IPC_PRIVATE` always creates a new queue. Otherwise the queue for `key`
/// is returned, created first if `IPC_CREAT` is set; `IPC_CREAT|IPC_EXCL`
/// fails on an existing key.
pub(crate) fn sys_msgget(call: &mut Call<'_>, key: i32, msgflg: i32) -> IpcResult<Completion> {
    let flags = IpcFlags::from_bits_truncate(msgflg);

    if key != IPC_PRIVATE {
        if let Some(id) = call.ns.queues.find_key(key) {
            if flags.contains(IpcFlags::IPC_CREAT | IpcFlags::IPC_EXCL) {
                return Err(IpcError::AlreadyExists);
            }
            return Ok(Completion::Done(id.raw().into()));
        }
        if !flags.contains(IpcFlags::IPC_CREAT) {
            return Err(IpcError::NotFound);
        }
    }

    let perm = IpcPerm::new(key, call.tracee.credentials(), msgflg, 0);
    let queue = MsgQueue::new(perm, call.limits.msgmnb, call.now);
    let id = call.ns.queues.allocate(key, queue)?;
    // seq mirrors the slot generation
    call.ns.queues.lookup_mut(id)?.ds.perm.seq = id.generation();

    debug!("sysvipc: msgget key={:#x} created {:?} in {:?}", key, id, call.ns.id());
    Ok(Completion::Done(id.raw().into()))
}

/// msgsnd - send a message to a message queue
///
/// msgp points to struct { long mtype; char mtext[msgsz]; }
pub(crate) fn sys_msgsnd(
    call: &mut Call<'_>,
    msqid: i32,
    msgp: u64,
    msgsz: i64,
    msgflg: i32,
) -> IpcResult<Completion> {
    let size = usize::try_from(msgsz).map_err(|_| IpcError::Invalid)?;
    if size > call.limits.msgmax {
        return Err(IpcError::MessageSize);
    }

    let base = user_addr(msgp)?;
    let mtype = read_i64(call.tracee, base)?;
    if mtype <= 0 {
        return Err(IpcError::Invalid);
    }
    let data = call.tracee.read_vec(offset_addr(base, MTYPE_SIZE)?, size)?;

    let req = SendRequest {
        message: Message::new(mtype, data),
        flags: IpcFlags::from_bits_truncate(msgflg),
    };
    send(call, IpcId::from_raw(msqid), req)
}

/// Queues a message, or blocks while the queue is full.
pub(crate) fn send(call: &mut Call<'_>, id: IpcId, req: SendRequest) -> IpcResult<Completion> {
    let pid = call.tracee.pid();
    let queue = call.ns.queues.lookup_mut(id)?;

    if !queue.fits(queue.bytes(), queue.len(), req.message.size()) {
        if req.flags.contains(IpcFlags::IPC_NOWAIT) {
            return Err(IpcError::WouldBlock);
        }
        trace!("sysvipc: msgsnd on full {:?} blocks", id);
        return Ok(Completion::Block(WaitRequest::QueueSend { id, req }));
    }

    trace!("sysvipc: msgsnd {:?} mtype={} len={}", id, req.message.mtype, req.message.size());
    queue.push(req.message, pid, call.now);
    call.wake = Some(Wake::Queue(id));
    Ok(Completion::Done(0))
}

/// msgrcv - receive a message from a message queue
///
/// Returns the number of bytes copied into mtext.
pub(crate) fn sys_msgrcv(
    call: &mut Call<'_>,
    msqid: i32,
    msgp: u64,
    msgsz: i64,
    msgtyp: i64,
    msgflg: i32,
) -> IpcResult<Completion> {
    let size = usize::try_from(msgsz).map_err(|_| IpcError::Invalid)?;
    let flags = IpcFlags::from_bits_truncate(msgflg);

    if flags.contains(IpcFlags::MSG_COPY)
        && (!flags.contains(IpcFlags::IPC_NOWAIT) || flags.contains(IpcFlags::MSG_EXCEPT))
    {
        return Err(IpcError::Invalid);
    }

    let req = RecvRequest { msgp: user_addr(msgp)?, size, msgtyp, flags };
    receive(call, IpcId::from_raw(msqid), req)
}

/// Takes the selected message, or blocks while none matches.
pub(crate) fn receive(call: &mut Call<'_>, id: IpcId, req: RecvRequest) -> IpcResult<Completion> {
    let pid = call.tracee.pid();
    let queue = call.ns.queues.lookup_mut(id)?;

    let Some(position) = queue.select(req.msgtyp, req.flags, &[]) else {
        if req.flags.contains(IpcFlags::IPC_NOWAIT) {
            return Err(IpcError::NoMessage);
        }
        trace!("sysvipc: msgrcv {:?} type={} blocks", id, req.msgtyp);
        return Ok(Completion::Block(WaitRequest::QueueRecv { id, req }));
    };

    let msg = queue.get(position).ok_or(IpcError::NoMessage)?;
    if msg.size() > req.size && !req.flags.contains(IpcFlags::MSG_NOERROR) {
        return Err(IpcError::TooBig);
    }
    let copied = msg.size().min(req.size);

    // Copy out before dequeuing so a bad buffer loses nothing.
    call.tracee.write_memory(req.msgp, &msg.mtype.to_ne_bytes())?;
    call.tracee.write_memory(offset_addr(req.msgp, MTYPE_SIZE)?, &msg.data[..copied])?;

    if !req.flags.contains(IpcFlags::MSG_COPY) {
        queue.take(position, pid, call.now);
        call.wake = Some(Wake::Queue(id));
    }
    trace!("sysvipc: msgrcv {:?} -> {} bytes", id, copied);
    Ok(Completion::Done(copied as i64))
}

/// msgctl - control operations on a message queue
pub(crate) fn sys_msgctl(call: &mut Call<'_>, msqid: i32, cmd: i32, buf: u64) -> IpcResult<Completion> {
    let id = IpcId::from_raw(msqid);

    match cmd & !IPC_64 {
        IPC_STAT => {
            let ds = call.ns.queues.lookup(id)?.stat().encode();
            call.tracee.write_memory(user_addr(buf)?, &ds)?;
            Ok(Completion::Done(0))
        }

        IPC_SET => {
            call.ns.queues.lookup(id)?;
            let raw = call.tracee.read_vec(user_addr(buf)?, MSQID_DS_SIZE)?;
            call.ns.queues.lookup_mut(id)?.set(&raw, call.now);
            // a larger quota may admit blocked senders
            call.wake = Some(Wake::Queue(id));
            Ok(Completion::Done(0))
        }

        IPC_RMID => {
            let queue = call.ns.queues.remove(id)?;
            debug!("sysvipc: msgctl removed {:?} ({} messages dropped)", id, queue.len());
            call.wake = Some(Wake::QueueRemoved(id));
            Ok(Completion::Done(0))
        }

        _ => Err(IpcError::Invalid),
    }
}
