//! Generation-tagged slot store backing both message queues and semaphore
//! sets.
//!
//! Public identifiers pack the slot position and a per-slot generation:
//!
//! ```text
//!   bits 0..11   index + 1   (0 is never a valid id)
//!   bits 12..27  generation
//! ```
//!
//! A slot's generation is bumped every time it is freed, so an identifier
//! captured before `IPC_RMID` stops matching once the slot is reused. The
//! counter is 16 bits wide and wraps: after 65536 removals of one slot an
//! old identifier aliases the new object again. The width is fixed by the
//! identifier encoding the traced programs observe.

use alloc::vec::Vec;
use core::fmt;

use crate::util::{IpcError, IpcResult};

pub const INDEX_BITS: u32 = 12;
const INDEX_MASK: i32 = (1 << INDEX_BITS) - 1;

/// Live objects per kind per namespace (the 12-bit index field minus id 0).
pub const MAX_SLOTS: usize = INDEX_MASK as usize;

/// Identifier of an IPC object as returned by `msgget`/`semget`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpcId(i32);

impl IpcId {
    pub const fn new(index: usize, generation: u16) -> Self {
        Self((index as i32 + 1) | ((generation as i32) << INDEX_BITS))
    }

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Slot position, or `None` for ids that cannot name any slot.
    pub fn index(self) -> Option<usize> {
        // bits above the generation field are never handed out
        if self.0 < 0 || self.0 >> (INDEX_BITS + 16) != 0 {
            return None;
        }
        match self.0 & INDEX_MASK {
            0 => None,
            low => Some(low as usize - 1),
        }
    }

    pub const fn generation(self) -> u16 {
        ((self.0 >> INDEX_BITS) & 0xFFFF) as u16
    }
}

impl fmt::Debug for IpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcId({:#x})", self.0)
    }
}

struct Slot<T> {
    generation: u16,
    key: i32,
    /// `Some` while the slot is valid.
    payload: Option<T>,
}

/// Growable table of generation-tagged slots.
///
/// Slots never move, and freed slots are reused lowest index first.
pub struct SlotStore<T> {
    slots: Vec<Slot<T>>,
}

impl<T> SlotStore<T> {
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Stores `payload` under `key` and returns its identifier.
    pub fn allocate(&mut self, key: i32, payload: T) -> IpcResult<IpcId> {
        if let Some(index) = self.slots.iter().position(|s| s.payload.is_none()) {
            let slot = &mut self.slots[index];
            slot.key = key;
            slot.payload = Some(payload);
            return Ok(IpcId::new(index, slot.generation));
        }

        let index = self.slots.len();
        if index >= MAX_SLOTS {
            return Err(IpcError::NoSpace);
        }
        self.slots.try_reserve(1).map_err(|_| IpcError::NoMemory)?;
        self.slots.push(Slot { generation: 0, key, payload: Some(payload) });
        Ok(IpcId::new(index, 0))
    }

    fn slot_index(&self, id: IpcId) -> IpcResult<usize> {
        let index = id.index().ok_or(IpcError::Invalid)?;
        match self.slots.get(index) {
            Some(slot) if slot.payload.is_some() && slot.generation == id.generation() => Ok(index),
            _ => Err(IpcError::Invalid),
        }
    }

    pub fn lookup(&self, id: IpcId) -> IpcResult<&T> {
        let index = self.slot_index(id)?;
        self.slots[index].payload.as_ref().ok_or(IpcError::Invalid)
    }

    pub fn lookup_mut(&mut self, id: IpcId) -> IpcResult<&mut T> {
        let index = self.slot_index(id)?;
        self.slots[index].payload.as_mut().ok_or(IpcError::Invalid)
    }

    /// Frees the slot and hands the payload back to the caller.
    pub fn remove(&mut self, id: IpcId) -> IpcResult<T> {
        let index = self.slot_index(id)?;
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.payload.take().ok_or(IpcError::Invalid)
    }

    /// Identifier of the live object created under `key`.
    pub fn find_key(&self, key: i32) -> Option<IpcId> {
        self.iter_slots().find(|(_, s)| s.key == key).map(|(id, _)| id)
    }

    /// Iterates live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (IpcId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.payload.as_ref().map(|p| (IpcId::new(index, slot.generation), p))
        })
    }

    fn iter_slots(&self) -> impl Iterator<Item = (IpcId, &Slot<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.payload.is_some())
            .map(|(index, s)| (IpcId::new(index, s.generation), s))
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.payload.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SlotStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
