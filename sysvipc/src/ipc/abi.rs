//! In-memory layouts of the kernel IPC structures the tracee passes by
//! pointer (x86_64 `ipc64_perm`, `msqid64_ds`, `semid64_ds`, `sembuf`,
//! `timespec`).
//!
//! Structures are encoded field by field at fixed offsets instead of being
//! transmuted, since they only ever live in the tracee's address space.

use core::time::Duration;

use crate::tracee::Credentials;
use crate::util::{IpcError, IpcResult};

/// `IPC_64` bit glibc ors into every ctl command.
pub const IPC_64: i32 = 0x100;

pub const IPC_PERM_SIZE: usize = 48;
pub const MSQID_DS_SIZE: usize = 120;
pub const SEMID_DS_SIZE: usize = 104;
pub const SEMBUF_SIZE: usize = 6;
pub const TIMESPEC_SIZE: usize = 16;

fn put_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(raw)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(raw)
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    get_u64(buf, off) as i64
}

/// `struct ipc64_perm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcPerm {
    pub key: i32,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    /// Permission bits (low 9 bits).
    pub mode: u32,
    pub seq: u16,
}

impl IpcPerm {
    pub fn new(key: i32, creds: Credentials, flags: i32, seq: u16) -> Self {
        Self {
            key,
            uid: creds.uid,
            gid: creds.gid,
            cuid: creds.uid,
            cgid: creds.gid,
            mode: (flags & 0o777) as u32,
            seq,
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_i32(buf, 0, self.key);
        put_u32(buf, 4, self.uid);
        put_u32(buf, 8, self.gid);
        put_u32(buf, 12, self.cuid);
        put_u32(buf, 16, self.cgid);
        put_u32(buf, 20, self.mode);
        buf[24..26].copy_from_slice(&self.seq.to_ne_bytes());
    }

    /// Applies the fields `IPC_SET` may change from a user-supplied block.
    pub fn update_from(&mut self, buf: &[u8]) {
        self.uid = get_u32(buf, 4);
        self.gid = get_u32(buf, 8);
        self.mode = get_u32(buf, 20) & 0o777;
    }
}

/// `struct msqid64_ds`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsqidDs {
    pub perm: IpcPerm,
    pub stime: i64,
    pub rtime: i64,
    pub ctime: i64,
    pub cbytes: u64,
    pub qnum: u64,
    pub qbytes: u64,
    pub lspid: i32,
    pub lrpid: i32,
}

impl MsqidDs {
    pub fn encode(&self) -> [u8; MSQID_DS_SIZE] {
        let mut buf = [0u8; MSQID_DS_SIZE];
        self.perm.encode(&mut buf);
        put_i64(&mut buf, 48, self.stime);
        put_i64(&mut buf, 56, self.rtime);
        put_i64(&mut buf, 64, self.ctime);
        put_u64(&mut buf, 72, self.cbytes);
        put_u64(&mut buf, 80, self.qnum);
        put_u64(&mut buf, 88, self.qbytes);
        put_i32(&mut buf, 96, self.lspid);
        put_i32(&mut buf, 100, self.lrpid);
        buf
    }

    /// `msg_qbytes` of a user-supplied block.
    pub fn qbytes_of(buf: &[u8]) -> u64 {
        get_u64(buf, 88)
    }
}

/// `struct semid64_ds`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemidDs {
    pub perm: IpcPerm,
    pub otime: i64,
    pub ctime: i64,
    pub nsems: u64,
}

impl SemidDs {
    pub fn encode(&self) -> [u8; SEMID_DS_SIZE] {
        let mut buf = [0u8; SEMID_DS_SIZE];
        self.perm.encode(&mut buf);
        put_i64(&mut buf, 48, self.otime);
        put_i64(&mut buf, 64, self.ctime);
        put_u64(&mut buf, 80, self.nsems);
        buf
    }
}

/// `struct sembuf`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sembuf {
    pub sem_num: u16,
    pub sem_op: i16,
    pub sem_flg: i16,
}

impl Sembuf {
    pub fn decode(raw: &[u8]) -> Self {
        Self {
            sem_num: u16::from_ne_bytes([raw[0], raw[1]]),
            sem_op: i16::from_ne_bytes([raw[2], raw[3]]),
            sem_flg: i16::from_ne_bytes([raw[4], raw[5]]),
        }
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; SEMBUF_SIZE] {
        let mut buf = [0u8; SEMBUF_SIZE];
        buf[0..2].copy_from_slice(&self.sem_num.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.sem_op.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.sem_flg.to_ne_bytes());
        buf
    }
}

/// Decodes a relative `struct timespec`; negative or denormal values are `EINVAL`.
pub fn decode_timespec(buf: &[u8]) -> IpcResult<Duration> {
    let sec = get_i64(buf, 0);
    let nsec = get_i64(buf, 8);
    if sec < 0 || !(0..1_000_000_000).contains(&nsec) {
        return Err(IpcError::Invalid);
    }
    Ok(Duration::new(sec as u64, nsec as u32))
}
