//! Bounded flow table.
//!
//! Capacity check, slot pick and count increment happen under one lock, so
//! concurrent admissions can neither overshoot the ceiling nor share a slot.
//! A reserved slot is invisible to lookups until [`Reservation::commit`]
//! publishes a fully built flow; dropping an uncommitted reservation gives
//! the slot back.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowId};
use crate::settings::{FlowSettings, SourceSettings};

enum Slot {
    Free,
    Reserved(FlowId),
    Live(Flow),
}

struct RegistryInner {
    slots: Vec<Slot>,
    free_slots: BTreeSet<usize>,
    index: HashMap<FlowId, usize>,
    count: usize,
    next_flow_id: u32,
}

/// Point-in-time view of the registry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Reserved plus live flows.
    pub count: usize,
    /// Configured ceiling.
    pub capacity: usize,
    /// Flows visible to lookups.
    pub live: usize,
    /// Slots held by admissions in progress.
    pub reserved: usize,
    /// Identifier the next reservation will receive.
    pub next_flow_id: u32,
    /// Slots allocated so far (high-water mark).
    pub slots: usize,
}

/// Fixed-capacity table of flows.
pub struct FlowRegistry {
    max_flows: usize,
    inner: Mutex<RegistryInner>,
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl FlowRegistry {
    /// Creates an empty registry holding at most `max_flows` flows.
    pub fn new(max_flows: usize) -> Self {
        Self {
            max_flows,
            inner: Mutex::new(RegistryInner {
                slots: Vec::new(),
                free_slots: BTreeSet::new(),
                index: HashMap::new(),
                count: 0,
                next_flow_id: 0,
            }),
        }
    }

    /// Reserves a slot and a fresh flow id, or fails without touching any state.
    pub fn reserve(&self) -> Result<Reservation<'_>> {
        let mut inner = self.inner.lock();
        if inner.count >= self.max_flows {
            return Err(FlowError::CapacityExceeded {
                max: self.max_flows,
            });
        }

        let slot = match inner.free_slots.pop_first() {
            Some(slot) => slot,
            None => {
                inner.slots.push(Slot::Free);
                inner.slots.len() - 1
            }
        };
        // After the counter wraps, skip ids still held by long-lived flows.
        let mut raw = inner.next_flow_id;
        while inner.index.contains_key(&FlowId::new(raw)) {
            raw = raw.wrapping_add(1);
        }
        let id = FlowId::new(raw);
        inner.next_flow_id = raw.wrapping_add(1);
        inner.slots[slot] = Slot::Reserved(id);
        inner.index.insert(id, slot);
        inner.count += 1;

        debug!(flow_id = %id, slot, count = inner.count, "reserved flow slot");
        Ok(Reservation {
            registry: self,
            slot,
            id,
            committed: false,
        })
    }

    fn release_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.slots[slot], Slot::Free) {
            Slot::Reserved(id) => {
                inner.index.remove(&id);
                inner.free_slots.insert(slot);
                inner.count -= 1;
                debug!(flow_id = %id, slot, count = inner.count, "released reservation");
            }
            other => {
                inner.slots[slot] = other;
                warn!(slot, "release of a slot that is not reserved");
            }
        }
    }

    /// Takes a flow out of the table, freeing its slot. The caller owns teardown.
    pub fn remove(&self, id: FlowId) -> Option<Flow> {
        let mut inner = self.inner.lock();
        let slot = *inner.index.get(&id)?;
        let flow = match std::mem::replace(&mut inner.slots[slot], Slot::Free) {
            Slot::Live(flow) => flow,
            other => {
                inner.slots[slot] = other;
                return None;
            }
        };
        inner.index.remove(&id);
        inner.free_slots.insert(slot);
        inner.count -= 1;
        debug!(flow_id = %id, slot, count = inner.count, "removed flow");
        Some(flow)
    }

    /// Removes and destroys a flow. Returns whether it existed.
    pub fn destroy(&self, id: FlowId) -> bool {
        match self.remove(id) {
            Some(flow) => {
                flow.destroy();
                true
            }
            None => false,
        }
    }

    /// Runs `f` on a live flow.
    pub fn with_flow<R>(&self, id: FlowId, f: impl FnOnce(&Flow) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let slot = *inner.index.get(&id)?;
        match &inner.slots[slot] {
            Slot::Live(flow) => Some(f(flow)),
            _ => None,
        }
    }

    /// Runs `f` on a live flow with mutable access.
    pub fn with_flow_mut<R>(&self, id: FlowId, f: impl FnOnce(&mut Flow) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let slot = *inner.index.get(&id)?;
        match &mut inner.slots[slot] {
            Slot::Live(flow) => Some(f(flow)),
            _ => None,
        }
    }

    /// Identifiers of live flows, ascending.
    pub fn ids(&self) -> Vec<FlowId> {
        let inner = self.inner.lock();
        let mut ids: Vec<FlowId> = inner
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Live(flow) => Some(flow.id()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// Reserved plus live flows.
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    /// Whether no flow is reserved or live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured ceiling.
    pub fn capacity(&self) -> usize {
        self.max_flows
    }

    /// Whether another reservation would be refused.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_flows
    }

    /// Bookkeeping snapshot.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock();
        let reserved = inner
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Reserved(_)))
            .count();
        RegistrySnapshot {
            count: inner.count,
            capacity: self.max_flows,
            live: inner.index.len() - reserved,
            reserved,
            next_flow_id: inner.next_flow_id,
            slots: inner.slots.len(),
        }
    }
}

/// A slot held by an admission in progress.
///
/// Dropping it without [`commit`](Self::commit) releases the slot.
#[must_use = "dropping a reservation releases its slot"]
pub struct Reservation<'a> {
    registry: &'a FlowRegistry,
    slot: usize,
    id: FlowId,
    committed: bool,
}

impl<'a> Reservation<'a> {
    /// Identifier reserved for the flow.
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Slot index backing the reservation.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Creates the flow record bound to this reservation.
    pub fn new_flow(&self, settings: FlowSettings, source_settings: SourceSettings) -> Flow {
        Flow::new(self.id, settings, source_settings)
    }

    /// Publishes `flow` in the reserved slot.
    pub fn commit(mut self, flow: Flow) -> FlowId {
        debug_assert_eq!(flow.id(), self.id, "flow committed into a foreign reservation");
        let mut inner = self.registry.inner.lock();
        inner.slots[self.slot] = Slot::Live(flow);
        self.committed = true;
        self.id
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release_slot(self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowState;
    use std::sync::Arc;

    fn commit_empty(registry: &FlowRegistry) -> FlowId {
        let reservation = registry.reserve().unwrap();
        let mut flow = reservation.new_flow(
            FlowSettings::default(),
            SourceSettings::new("127.0.0.1", 5999),
        );
        flow.set_state(FlowState::AwaitingConnect);
        reservation.commit(flow)
    }

    #[test]
    fn test_ids_are_sequential() {
        let registry = FlowRegistry::new(4);
        assert_eq!(commit_empty(&registry), FlowId::new(0));
        assert_eq!(commit_empty(&registry), FlowId::new(1));
        assert_eq!(commit_empty(&registry), FlowId::new(2));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.ids(), vec![FlowId::new(0), FlowId::new(1), FlowId::new(2)]);
    }

    #[test]
    fn test_capacity_refusal_leaves_state_unchanged() {
        let registry = FlowRegistry::new(2);
        commit_empty(&registry);
        commit_empty(&registry);
        let before = registry.snapshot();

        let err = registry.reserve().err().unwrap();
        assert!(matches!(err, FlowError::CapacityExceeded { max: 2 }));
        assert_eq!(registry.snapshot(), before);
        assert!(registry.is_full());
    }

    #[test]
    fn test_dropped_reservation_releases_slot() {
        let registry = FlowRegistry::new(1);
        {
            let reservation = registry.reserve().unwrap();
            assert_eq!(reservation.slot(), 0);
            assert_eq!(registry.len(), 1);
            assert!(registry.with_flow(reservation.id(), |_| ()).is_none());
        }
        assert_eq!(registry.len(), 0);
        assert!(registry.reserve().is_ok());
    }

    #[test]
    fn test_remove_reuses_lowest_slot() {
        let registry = FlowRegistry::new(3);
        let a = commit_empty(&registry);
        let b = commit_empty(&registry);
        commit_empty(&registry);

        assert!(registry.destroy(b));
        assert!(registry.remove(a).is_some());
        assert_eq!(registry.len(), 1);

        let reservation = registry.reserve().unwrap();
        assert_eq!(reservation.slot(), 0);
        assert_eq!(reservation.id(), FlowId::new(3));
    }

    #[test]
    fn test_wrapped_ids_skip_live_flows() {
        let registry = FlowRegistry::new(4);
        let oldest = commit_empty(&registry);
        assert_eq!(oldest, FlowId::new(0));

        registry.inner.lock().next_flow_id = u32::MAX;
        assert_eq!(commit_empty(&registry), FlowId::new(u32::MAX));
        assert_eq!(commit_empty(&registry), FlowId::new(1));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.snapshot().live, 3);
        let state = registry.with_flow(oldest, |flow| flow.state());
        assert_eq!(state, Some(FlowState::AwaitingConnect));
        assert!(registry.destroy(oldest));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reserved_flow_is_not_visible() {
        let registry = FlowRegistry::new(2);
        let reservation = registry.reserve().unwrap();
        let id = reservation.id();
        assert!(registry.with_flow(id, |_| ()).is_none());
        assert!(registry.remove(id).is_none());
        assert!(registry.ids().is_empty());
        assert_eq!(registry.snapshot().reserved, 1);
        assert_eq!(registry.snapshot().live, 0);
        drop(reservation);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let registry = FlowRegistry::new(1);
        assert!(registry.remove(FlowId::new(42)).is_none());
        assert!(!registry.destroy(FlowId::new(42)));
    }

    #[test]
    fn test_with_flow_mut() {
        let registry = FlowRegistry::new(1);
        let id = commit_empty(&registry);
        let len = registry
            .with_flow_mut(id, |flow| flow.read_block_mut().len())
            .unwrap();
        assert_eq!(len, 0);
        let state = registry.with_flow(id, |flow| flow.state()).unwrap();
        assert_eq!(state, FlowState::AwaitingConnect);
    }

    #[test]
    fn test_concurrent_reservations_respect_ceiling() {
        let registry = Arc::new(FlowRegistry::new(8));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || match registry.reserve() {
                    Ok(reservation) => {
                        let flow = reservation.new_flow(
                            FlowSettings::default(),
                            SourceSettings::new("127.0.0.1", 1),
                        );
                        Some(reservation.commit(flow))
                    }
                    Err(_) => None,
                })
            })
            .collect();

        let mut ids: Vec<FlowId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(registry.len(), 8);
        assert_eq!(registry.snapshot().slots, 8);
    }
}
