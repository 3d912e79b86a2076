//! Port pool with placeholder ownership.

use std::collections::{BTreeSet, HashMap};

use super::placeholder::PlaceholderHandle;
use crate::errors::PreviewError;

/// Ports in `[min, max]`, each either free or owned by one run. A placeholder
/// responder can only be attached to an owned port and is shut down before
/// the port is freed.
#[derive(Debug)]
pub struct PortPool {
    min: u16,
    max: u16,
    used: BTreeSet<u16>,
    placeholders: HashMap<u16, PlaceholderHandle>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: BTreeSet::new(),
            placeholders: HashMap::new(),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Lowest free port, now marked used.
    pub fn allocate(&mut self) -> Result<u16, PreviewError> {
        let port = (self.min..=self.max)
            .find(|p| !self.used.contains(p))
            .ok_or(PreviewError::CapacityExhausted {
                min: self.min,
                max: self.max,
            })?;
        self.used.insert(port);
        Ok(port)
    }

    /// Shut down any placeholder on `port`, then free it.
    pub fn release(&mut self, port: u16) {
        if let Some(handle) = self.placeholders.remove(&port) {
            handle.shutdown();
        }
        self.used.remove(&port);
    }

    /// Attach a responder to an owned port, replacing any previous one.
    /// Returns false (and shuts the responder down) if the port is free.
    pub fn attach_placeholder(&mut self, handle: PlaceholderHandle) -> bool {
        let port = handle.port();
        if !self.used.contains(&port) {
            handle.shutdown();
            return false;
        }
        if let Some(previous) = self.placeholders.insert(port, handle) {
            previous.shutdown();
        }
        true
    }

    pub fn detach_placeholder(&mut self, port: u16) {
        if let Some(handle) = self.placeholders.remove(&port) {
            handle.shutdown();
        }
    }

    pub fn is_used(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    /// Shut down every placeholder without freeing ports.
    pub fn shutdown_placeholders(&mut self) {
        for (_, handle) in self.placeholders.drain() {
            handle.shutdown();
        }
    }
}
