//! Outstanding request table.
//!
//! Each entry owns the only completion sender for its request, so whichever
//! path removes the entry (response, NACK, timeout, teardown) is the one
//! that completes it.

use std::collections::HashMap;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::ClientError;

pub(crate) type Completion = Result<Vec<u8>, ClientError>;

struct PendingRequest {
    completion: oneshot::Sender<Completion>,
    ticket: u64,
    created: Instant,
}

/// A registered request slot.
pub(crate) struct Registration {
    pub message_id: u8,
    /// Distinguishes this registration from a later one reusing the id.
    pub ticket: u64,
    pub completion: oneshot::Receiver<Completion>,
}

pub(crate) struct PendingRequests {
    entries: HashMap<u8, PendingRequest>,
    next_id: u8,
    next_ticket: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
            next_ticket: 0,
        }
    }

    /// Allocate the next message id and register a request under it.
    ///
    /// Ids roll over after 255. If the id is still occupied by a stale
    /// request, that request is rejected with [`ClientError::Superseded`].
    pub fn register(&mut self) -> Registration {
        let message_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            completion: tx,
            ticket,
            created: Instant::now(),
        };
        if let Some(stale) = self.entries.insert(message_id, entry) {
            warn!(
                "Message id {} reused while still pending ({} ms old)",
                message_id,
                stale.created.elapsed().as_millis()
            );
            let _ = stale
                .completion
                .send(Err(ClientError::Superseded { message_id }));
        }

        Registration {
            message_id,
            ticket,
            completion: rx,
        }
    }

    /// Complete the request with a response payload.
    ///
    /// Returns false if nothing is pending under the id.
    pub fn resolve(&mut self, message_id: u8, payload: Vec<u8>) -> bool {
        match self.entries.remove(&message_id) {
            Some(entry) => {
                debug!(
                    "Request {} resolved after {} ms",
                    message_id,
                    entry.created.elapsed().as_millis()
                );
                let _ = entry.completion.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Fail the request with an error.
    pub fn reject(&mut self, message_id: u8, error: ClientError) -> bool {
        match self.entries.remove(&message_id) {
            Some(entry) => {
                let _ = entry.completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove the entry if it still belongs to the given registration.
    ///
    /// Used when the caller gives up (timeout, send failure, drop), so a
    /// newer request that reused the id is left alone.
    pub fn retire(&mut self, message_id: u8, ticket: u64) -> bool {
        if self
            .entries
            .get(&message_id)
            .is_some_and(|entry| entry.ticket == ticket)
        {
            self.entries.remove(&message_id);
            true
        } else {
            false
        }
    }

    /// Fail every pending request. Returns how many were failed.
    pub fn reject_all(&mut self, error: ClientError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.completion.send(Err(error.clone()));
        }
        count
    }

    #[cfg(test)]
    pub fn contains(&self, message_id: u8) -> bool {
        self.entries.contains_key(&message_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increment_and_wrap() {
        let mut pending = PendingRequests::new();
        let ids: Vec<u8> = (0..300)
            .map(|_| {
                let reg = pending.register();
                pending.retire(reg.message_id, reg.ticket);
                reg.message_id
            })
            .collect();
        assert_eq!(ids[0], 0);
        assert_eq!(ids[255], 255);
        assert_eq!(ids[256], 0);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_resolve_completes_once() {
        let mut pending = PendingRequests::new();
        let mut reg = pending.register();

        assert!(pending.resolve(reg.message_id, vec![1, 2]));
        assert!(!pending.resolve(reg.message_id, vec![3]));
        assert!(!pending.reject(reg.message_id, ClientError::Disconnected));

        assert_eq!(reg.completion.try_recv().unwrap(), Ok(vec![1, 2]));
    }

    #[test]
    fn test_reject() {
        let mut pending = PendingRequests::new();
        let mut reg = pending.register();
        let err = ClientError::Rejected {
            message_id: reg.message_id,
            reason: super::super::error::RejectReason::Nack,
        };
        assert!(pending.reject(reg.message_id, err.clone()));
        assert_eq!(reg.completion.try_recv().unwrap(), Err(err));
    }

    #[test]
    fn test_retire_respects_ticket() {
        let mut pending = PendingRequests::new();
        let first = pending.register();
        // Force reuse of id 0
        pending.next_id = 0;
        let mut second = pending.register();
        assert_eq!(first.message_id, second.message_id);

        // The stale caller giving up must not remove the new entry
        assert!(!pending.retire(first.message_id, first.ticket));
        assert!(pending.contains(second.message_id));

        assert!(pending.retire(second.message_id, second.ticket));
        assert!(second.completion.try_recv().is_err());
    }

    #[test]
    fn test_register_supersedes_stale_entry() {
        let mut pending = PendingRequests::new();
        let mut first = pending.register();
        pending.next_id = 0;
        let _second = pending.register();

        assert_eq!(
            first.completion.try_recv().unwrap(),
            Err(ClientError::Superseded { message_id: 0 })
        );
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_reject_all() {
        let mut pending = PendingRequests::new();
        let mut regs: Vec<_> = (0..3).map(|_| pending.register()).collect();

        assert_eq!(pending.reject_all(ClientError::Disconnected), 3);
        assert_eq!(pending.len(), 0);
        for reg in &mut regs {
            assert_eq!(reg.completion.try_recv().unwrap(), Err(ClientError::Disconnected));
        }
    }
}
