//! Packs the scalar properties of a compute unit into one uniform block.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::properties::{PropertyId, PropertySet, PropertyValue, RESERVED};
use crate::rhi::{ResourceUpdateBatch, RhiBuffer};
use crate::signal::SubscriptionId;

/// Every reflected entry occupies one 32-bit slot.
pub const ENTRY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Int,
    Bool,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniformEntry {
    pub name: String,
    pub kind: UniformKind,
    pub offset: usize,
    bits: [u8; ENTRY_SIZE],
}

impl UniformEntry {
    fn new(name: String, kind: UniformKind, offset: usize, value: &PropertyValue) -> Self {
        let mut entry = Self {
            name,
            kind,
            offset,
            bits: [0; ENTRY_SIZE],
        };
        entry.store(value);
        entry
    }

    /// Copies `value` in, converted to the entry's kind. Returns `false` and
    /// leaves the entry untouched when the value does not convert.
    fn store(&mut self, value: &PropertyValue) -> bool {
        let bits = match self.kind {
            UniformKind::Int | UniformKind::Bool => value.to_i32().map(i32::to_ne_bytes),
            UniformKind::Float => value.to_f32().map(f32::to_ne_bytes),
        };
        match bits {
            Some(bits) => {
                self.bits = bits;
                true
            }
            None => false,
        }
    }

    pub fn bytes(&self) -> [u8; ENTRY_SIZE] {
        self.bits
    }

    pub fn as_i32(&self) -> i32 {
        i32::from_ne_bytes(self.bits)
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_ne_bytes(self.bits)
    }
}

/// Uniform-block layout reflected from a [`PropertySet`].
#[derive(Debug, Default)]
pub struct UniformReflector {
    entries: Vec<UniformEntry>,
    by_property: HashMap<PropertyId, usize>,
    subscriptions: Vec<(PropertyId, SubscriptionId)>,
}

impl UniformReflector {
    /// Selects every notifying, non-reserved property that currently holds an
    /// int, bool or float, in declaration order.
    pub fn reflect(props: &PropertySet) -> Self {
        let mut reflector = Self::default();
        for id in props.ids() {
            if !props.has_notifier(id) {
                continue;
            }
            let (Some(name), Some(value)) = (props.name(id), props.get(id)) else {
                continue;
            };
            if RESERVED.contains(&name.as_str()) {
                continue;
            }
            let kind = match value {
                PropertyValue::Int(_) => UniformKind::Int,
                PropertyValue::Bool(_) => UniformKind::Bool,
                PropertyValue::Float(_) => UniformKind::Float,
                _ => continue,
            };
            let offset = reflector.entries.len() * ENTRY_SIZE;
            reflector
                .by_property
                .insert(id, reflector.entries.len());
            reflector
                .entries
                .push(UniformEntry::new(name, kind, offset, &value));
        }
        reflector
    }

    /// Reflects `props` and keeps the result current through the properties'
    /// change signals. The subscriptions hold only a weak reference.
    pub fn reflect_and_track(props: &PropertySet) -> Rc<RefCell<Self>> {
        let reflector = Rc::new(RefCell::new(Self::reflect(props)));
        let ids: Vec<PropertyId> = reflector.borrow().by_property.keys().copied().collect();

        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            let weak: Weak<RefCell<Self>> = Rc::downgrade(&reflector);
            let sub = props.on_changed(id, move |value| {
                if let Some(r) = weak.upgrade() {
                    r.borrow_mut().notify(id, value);
                }
            });
            if let Some(sub) = sub {
                subscriptions.push((id, sub));
            }
        }
        reflector.borrow_mut().subscriptions = subscriptions;
        reflector
    }

    /// Drops every change subscription made by [`Self::reflect_and_track`].
    pub fn untrack(&mut self, props: &PropertySet) {
        for (id, sub) in self.subscriptions.drain(..) {
            props.disconnect(id, sub);
        }
    }

    /// Applies a property change. No-op for unknown properties and values that
    /// do not convert to the entry's kind.
    pub fn notify(&mut self, id: PropertyId, value: &PropertyValue) -> bool {
        match self.by_property.get(&id) {
            Some(&index) => self.entries[index].store(value),
            None => false,
        }
    }

    pub fn total_size(&self) -> usize {
        self.entries.len() * ENTRY_SIZE
    }

    pub fn entries(&self) -> &[UniformEntry] {
        &self.entries
    }

    pub fn entry_for(&self, id: PropertyId) -> Option<&UniformEntry> {
        self.by_property.get(&id).map(|&i| &self.entries[i])
    }

    /// Queues every entry at its fixed offset into `buffer`.
    pub fn write_all(&self, batch: &mut ResourceUpdateBatch, buffer: RhiBuffer) {
        for entry in &self.entries {
            batch.update_dynamic_buffer(buffer, entry.offset as u64, entry.bytes().to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{DISPATCH_X, DISPATCH_Y, DISPATCH_Z};

    fn unit_like(order: &[&str]) -> PropertySet {
        let set = PropertySet::new();
        for name in order {
            match *name {
                "speed" => set.declare("speed", 0.5),
                "count" => set.declare("count", 12),
                "enabled" => set.declare("enabled", true),
                "label" => set.declare("label", "text"),
                n => set.declare(n, 1),
            };
        }
        set
    }

    #[test]
    fn size_counts_eligible_properties_in_any_order() {
        let a = unit_like(&[DISPATCH_X, "speed", DISPATCH_Y, "count", "label", "enabled", DISPATCH_Z]);
        let b = unit_like(&["enabled", "label", DISPATCH_Z, "count", DISPATCH_X, DISPATCH_Y, "speed"]);
        assert_eq!(UniformReflector::reflect(&a).total_size(), 12);
        assert_eq!(UniformReflector::reflect(&b).total_size(), 12);
    }

    #[test]
    fn constants_are_not_reflected() {
        let set = PropertySet::new();
        set.declare_constant("fixed", 3);
        set.declare("live", 3);
        let r = UniformReflector::reflect(&set);
        assert_eq!(r.entries().len(), 1);
        assert_eq!(r.entries()[0].name, "live");
    }

    #[test]
    fn tracked_values_follow_property_changes() {
        let set = PropertySet::new();
        let speed = set.declare("speed", 1.0);
        let flag = set.declare("flag", false);
        let r = UniformReflector::reflect_and_track(&set);

        set.set(speed, 0.25);
        set.set(flag, true);
        let r = r.borrow();
        assert_eq!(r.entry_for(speed).unwrap().as_f32(), 0.25);
        assert_eq!(r.entry_for(flag).unwrap().as_i32(), 1);
        assert_eq!(r.entry_for(flag).unwrap().offset, 4);
    }

    #[test]
    fn unconvertible_values_are_ignored() {
        let set = PropertySet::new();
        let id = set.declare("count", 5);
        let mut r = UniformReflector::reflect(&set);
        assert!(!r.notify(id, &PropertyValue::Text("nope".into())));
        assert_eq!(r.entry_for(id).unwrap().as_i32(), 5);
        assert!(r.notify(id, &PropertyValue::Float(8.7)));
        assert_eq!(r.entry_for(id).unwrap().as_i32(), 8);
    }

    #[test]
    fn write_all_uses_fixed_offsets() {
        let set = PropertySet::new();
        set.declare("a", 1);
        set.declare("b", 2.0);
        let r = UniformReflector::reflect(&set);
        let mut batch = ResourceUpdateBatch::new();
        let buffer = RhiBuffer::from_raw(3);
        r.write_all(&mut batch, buffer);

        assert_eq!(batch.len(), 2);
        assert_eq!(r.total_size(), 8);
        assert_eq!(r.entries()[1].offset, 4);
        assert_eq!(r.entries()[1].bytes(), 2.0f32.to_ne_bytes());
    }
}
