//! Correlates a connection's `upload_chunk_meta` frame with the binary frame
//! that follows it.
//!
//! Each connection has exactly one slot. Arming a slot that is already armed
//! replaces the previous token (last writer wins); the binary frame takes the
//! token and leaves the slot idle in one step.

use dashmap::DashMap;

use crate::{message::FileId, registry::ConnectionId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Binding {
    #[default]
    Idle,
    Armed(FileId),
}

impl Binding {
    fn take(&mut self) -> Option<FileId> {
        match std::mem::take(self) {
            Binding::Idle => None,
            Binding::Armed(file_id) => Some(file_id),
        }
    }
}

#[derive(Default)]
pub struct BinaryCorrelator {
    slots: DashMap<ConnectionId, Binding>,
}

impl BinaryCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the next binary frame on `conn` to `file_id`, returning the token
    /// it displaced, if any.
    pub fn arm(&self, conn: ConnectionId, file_id: FileId) -> Option<FileId> {
        let mut slot = self.slots.entry(conn).or_default();
        std::mem::replace(slot.value_mut(), Binding::Armed(file_id)).take()
    }

    /// Reads and clears the slot for `conn`.
    pub fn take(&self, conn: ConnectionId) -> Option<FileId> {
        self.slots.get_mut(&conn)?.value_mut().take()
    }

    pub fn peek(&self, conn: ConnectionId) -> Binding {
        self.slots
            .get(&conn)
            .map(|slot| slot.value().clone())
            .unwrap_or_default()
    }

    /// Forgets the slot for a connection that went away.
    pub fn release(&self, conn: ConnectionId) {
        self.slots.remove(&conn);
    }
}
