use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::CoreError;

/// Kind tag for every native handle the tool creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    // Vulkan
    VkInstance,
    VkDebugMessenger,
    VkDevice,
    VkImage,
    VkDeviceMemory,
    VkCommandPool,
    VkCommandBuffer,
    VkSurface,
    VkSwapchain,
    VkFence,
    // Kernel
    DmaBufFd,
    DrmCard,
    GemHandle,
    DrmFramebuffer,
}

/// Opaque id of one tracked handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerId(u64);

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEvent {
    Created(LedgerId, ResourceKind),
    Destroyed(LedgerId, ResourceKind),
}

/// Records creation and destruction of native handles.
/// Guards register themselves on creation and report on drop, so the
/// order in which handles were released can be checked afterwards.
pub struct HandleLedger {
    /// Handles created and not yet destroyed
    live: DashMap<LedgerId, ResourceKind>,
    /// Creation and destruction events in program order
    events: Mutex<Vec<LedgerEvent>>,
    /// Counter for generating unique ids
    next_id: AtomicU64,
}

impl HandleLedger {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
            events: Mutex::new(Vec::new()),
            // Start from 1 so a zeroed id never looks valid
            next_id: AtomicU64::new(1),
        }
    }

    /// Track a freshly created handle and return its id.
    pub fn record_create(&self, kind: ResourceKind) -> LedgerId {
        let id = LedgerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live.insert(id, kind);
        self.events.lock().push(LedgerEvent::Created(id, kind));
        tracing::trace!("created {:?} {}", kind, id);
        id
    }

    /// Mark a handle destroyed. Destroying an unknown or already destroyed
    /// handle is an error.
    pub fn record_destroy(&self, id: LedgerId) -> Result<ResourceKind, CoreError> {
        let (_, kind) = self
            .live
            .remove(&id)
            .ok_or_else(|| CoreError::HandleNotFound(id.to_string()))?;
        self.events.lock().push(LedgerEvent::Destroyed(id, kind));
        tracing::trace!("destroyed {:?} {}", kind, id);
        Ok(kind)
    }

    /// Number of handles still alive.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Live handles of one kind.
    pub fn live_of(&self, kind: ResourceKind) -> usize {
        self.live.iter().filter(|e| *e.value() == kind).count()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().clone()
    }

    /// Kinds in creation order.
    pub fn creation_order(&self) -> Vec<ResourceKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LedgerEvent::Created(_, kind) => Some(*kind),
                LedgerEvent::Destroyed(..) => None,
            })
            .collect()
    }

    /// Kinds in destruction order.
    pub fn destruction_order(&self) -> Vec<ResourceKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LedgerEvent::Destroyed(_, kind) => Some(*kind),
                LedgerEvent::Created(..) => None,
            })
            .collect()
    }

    /// Every created handle has been destroyed exactly once.
    pub fn is_balanced(&self) -> bool {
        self.live.is_empty()
    }

    /// Every destruction released the most recently created live handle.
    pub fn destroyed_in_reverse_order(&self) -> bool {
        let mut stack = Vec::new();
        for event in self.events.lock().iter() {
            match event {
                LedgerEvent::Created(id, _) => stack.push(*id),
                LedgerEvent::Destroyed(id, _) => {
                    if stack.pop() != Some(*id) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl Default for HandleLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_release_is_reverse_order() {
        let ledger = HandleLedger::new();
        let instance = ledger.record_create(ResourceKind::VkInstance);
        let device = ledger.record_create(ResourceKind::VkDevice);
        let image = ledger.record_create(ResourceKind::VkImage);
        assert_eq!(ledger.live(), 3);

        ledger.record_destroy(image).unwrap();
        ledger.record_destroy(device).unwrap();
        ledger.record_destroy(instance).unwrap();

        assert!(ledger.is_balanced());
        assert!(ledger.destroyed_in_reverse_order());
        assert_eq!(
            ledger.destruction_order(),
            vec![ResourceKind::VkImage, ResourceKind::VkDevice, ResourceKind::VkInstance]
        );
    }

    #[test]
    fn out_of_order_release_is_detected() {
        let ledger = HandleLedger::new();
        let instance = ledger.record_create(ResourceKind::VkInstance);
        let device = ledger.record_create(ResourceKind::VkDevice);
        ledger.record_destroy(instance).unwrap();
        ledger.record_destroy(device).unwrap();
        assert!(ledger.is_balanced());
        assert!(!ledger.destroyed_in_reverse_order());
    }

    #[test]
    fn double_destroy_is_rejected() {
        let ledger = HandleLedger::new();
        let fd = ledger.record_create(ResourceKind::DmaBufFd);
        assert_eq!(ledger.record_destroy(fd).unwrap(), ResourceKind::DmaBufFd);
        assert!(matches!(
            ledger.record_destroy(fd),
            Err(CoreError::HandleNotFound(_))
        ));
    }

    #[test]
    fn live_counts_by_kind() {
        let ledger = HandleLedger::new();
        ledger.record_create(ResourceKind::GemHandle);
        let fb = ledger.record_create(ResourceKind::DrmFramebuffer);
        ledger.record_create(ResourceKind::DrmFramebuffer);
        assert_eq!(ledger.live_of(ResourceKind::DrmFramebuffer), 2);
        ledger.record_destroy(fb).unwrap();
        assert_eq!(ledger.live_of(ResourceKind::DrmFramebuffer), 1);
        assert!(!ledger.is_balanced());
    }
}
