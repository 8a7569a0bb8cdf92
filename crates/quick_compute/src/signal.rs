//! Synchronous observer lists.
//!
//! Every mutable entity that others need to react to (a shader buffer, a
//! property, a compute unit) owns one [`Signal`] per notification. Subscribers
//! are plain closures invoked in connection order on the emitting thread.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifies one subscription on one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Slot<T> = Rc<dyn Fn(&T)>;

/// An ordered list of subscriber callbacks.
pub struct Signal<T = ()> {
    slots: RefCell<Vec<(SubscriptionId, Slot<T>)>>,
    next_id: Cell<u64>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber.
    pub fn connect(&self, slot: impl Fn(&T) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.slots.borrow_mut().push((id, Rc::new(slot)));
        id
    }

    /// Removes a subscriber. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|(sid, _)| *sid != id);
        slots.len() != before
    }

    pub fn disconnect_all(&self) {
        self.slots.borrow_mut().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Invokes every subscriber with `value`.
    ///
    /// The list is snapshotted first, so subscribers may connect or disconnect
    /// while being notified; such changes apply from the next emission.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Slot<T>> = self
            .slots
            .borrow()
            .iter()
            .map(|(_, slot)| Rc::clone(slot))
            .collect();
        for slot in snapshot {
            slot(value);
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_in_connection_order() {
        let signal = Signal::<u32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l1 = log.clone();
        signal.connect(move |v| l1.borrow_mut().push(("a", *v)));
        let l2 = log.clone();
        signal.connect(move |v| l2.borrow_mut().push(("b", *v)));

        signal.emit(&7);
        assert_eq!(*log.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn disconnect_stops_delivery() {
        let signal = Signal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = signal.connect(move |_| h.set(h.get() + 1));

        signal.emit(&());
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn subscriber_may_disconnect_itself_while_notified() {
        let signal = Rc::new(Signal::<()>::new());
        let hits = Rc::new(Cell::new(0));
        let id_cell = Rc::new(Cell::new(None));

        let (s, h, idc) = (Rc::downgrade(&signal), hits.clone(), id_cell.clone());
        let id = signal.connect(move |_| {
            h.set(h.get() + 1);
            if let (Some(sig), Some(id)) = (s.upgrade(), idc.get()) {
                sig.disconnect(id);
            }
        });
        id_cell.set(Some(id));

        signal.emit(&());
        signal.emit(&());
        assert_eq!(hits.get(), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }
}
