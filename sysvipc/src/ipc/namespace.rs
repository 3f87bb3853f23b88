//! IPC namespaces.
//!
//! A namespace owns the message queues and semaphore sets visible to a group
//! of tracees. Tracees share it through an `Arc`; it is dropped together with
//! the last member. Members are matched by [`NamespaceId`], never by
//! pointer identity.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::msg::MsgQueue;
use super::sem::SemSet;
use super::slots::SlotStore;

/// Namespace ID counter
static NAMESPACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of an IPC namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespaceId(u64);

impl NamespaceId {
    fn next() -> Self {
        Self(NAMESPACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Namespace shared by its member tracees.
pub type SharedNamespace = Arc<Mutex<IpcNamespace>>;

/// IPC namespace data
pub struct IpcNamespace {
    id: NamespaceId,
    /// Message queues
    pub queues: SlotStore<MsgQueue>,
    /// Semaphore sets
    pub semaphores: SlotStore<SemSet>,
}

impl IpcNamespace {
    pub fn new() -> Self {
        Self {
            id: NamespaceId::next(),
            queues: SlotStore::new(),
            semaphores: SlotStore::new(),
        }
    }

    /// Creates an empty namespace ready to be shared.
    pub fn new_shared() -> SharedNamespace {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }
}

impl Default for IpcNamespace {
    fn default() -> Self {
        Self::new()
    }
}
