//! Named, dynamically typed properties of a compute unit.
//!
//! Properties are registered explicitly instead of being discovered at
//! runtime. A property declared with [`PropertySet::declare`] owns a change
//! signal; one declared with [`PropertySet::declare_constant`] does not and is
//! therefore never reflected into the uniform block.

use std::cell::RefCell;
use std::rc::Rc;

use crate::signal::{Signal, SubscriptionId};

pub const COMPUTE_SHADER: &str = "computeShader";
pub const DISPATCH_X: &str = "dispatchX";
pub const DISPATCH_Y: &str = "dispatchY";
pub const DISPATCH_Z: &str = "dispatchZ";

/// Names that exist on every unit and never take part in uniform reflection.
pub const RESERVED: [&str; 3] = [DISPATCH_X, DISPATCH_Y, DISPATCH_Z];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(u32);

impl PropertyId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PropertyValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    Text(String),
    #[default]
    Invalid,
}

impl PropertyValue {
    pub fn to_i32(&self) -> Option<i32> {
        match *self {
            PropertyValue::Int(v) => Some(v as i32),
            PropertyValue::Bool(v) => Some(v as i32),
            PropertyValue::Float(v) => Some(v as i32),
            _ => None,
        }
    }

    pub fn to_f32(&self) -> Option<f32> {
        match *self {
            PropertyValue::Int(v) => Some(v as f32),
            PropertyValue::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            PropertyValue::Float(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn same_kind(&self, other: &PropertyValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(v as f64)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

struct Property {
    name: String,
    value: PropertyValue,
    changed: Option<Rc<Signal<PropertyValue>>>,
}

/// Outcome of [`PropertySet::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Unchanged,
    /// Same kind, new value.
    Value,
    /// The value switched kind, which changes the uniform layout.
    Kind,
}

/// Ordered property table of one compute unit.
#[derive(Default)]
pub struct PropertySet {
    props: RefCell<Vec<Property>>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a notifying property, or returns the existing id if the name
    /// is taken.
    pub fn declare(&self, name: &str, value: impl Into<PropertyValue>) -> PropertyId {
        self.insert(name, value.into(), true)
    }

    /// Declares a property without change notification.
    pub fn declare_constant(&self, name: &str, value: impl Into<PropertyValue>) -> PropertyId {
        self.insert(name, value.into(), false)
    }

    fn insert(&self, name: &str, value: PropertyValue, notifying: bool) -> PropertyId {
        if let Some(id) = self.find(name) {
            return id;
        }
        let mut props = self.props.borrow_mut();
        props.push(Property {
            name: name.to_owned(),
            value,
            changed: notifying.then(|| Rc::new(Signal::new())),
        });
        PropertyId((props.len() - 1) as u32)
    }

    pub fn find(&self, name: &str) -> Option<PropertyId> {
        self.props
            .borrow()
            .iter()
            .position(|p| p.name == name)
            .map(|i| PropertyId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.props.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in declaration order.
    pub fn ids(&self) -> Vec<PropertyId> {
        (0..self.len() as u32).map(PropertyId).collect()
    }

    pub fn name(&self, id: PropertyId) -> Option<String> {
        self.props.borrow().get(id.index()).map(|p| p.name.clone())
    }

    pub fn get(&self, id: PropertyId) -> Option<PropertyValue> {
        self.props.borrow().get(id.index()).map(|p| p.value.clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<PropertyValue> {
        self.find(name).and_then(|id| self.get(id))
    }

    pub fn has_notifier(&self, id: PropertyId) -> bool {
        self.props
            .borrow()
            .get(id.index())
            .is_some_and(|p| p.changed.is_some())
    }

    /// Stores `value` and notifies subscribers if it differs from the current
    /// one.
    pub fn set(&self, id: PropertyId, value: impl Into<PropertyValue>) -> SetOutcome {
        let value = value.into();
        let (outcome, signal) = {
            let mut props = self.props.borrow_mut();
            let Some(prop) = props.get_mut(id.index()) else {
                return SetOutcome::Unchanged;
            };
            if prop.value == value {
                return SetOutcome::Unchanged;
            }
            let outcome = if prop.value.same_kind(&value) {
                SetOutcome::Value
            } else {
                SetOutcome::Kind
            };
            prop.value = value.clone();
            (outcome, prop.changed.clone())
        };
        if let Some(signal) = signal {
            signal.emit(&value);
        }
        outcome
    }

    pub fn on_changed(
        &self,
        id: PropertyId,
        slot: impl Fn(&PropertyValue) + 'static,
    ) -> Option<SubscriptionId> {
        let signal = self.props.borrow().get(id.index())?.changed.clone()?;
        Some(signal.connect(slot))
    }

    pub fn disconnect(&self, id: PropertyId, subscription: SubscriptionId) -> bool {
        let signal = self
            .props
            .borrow()
            .get(id.index())
            .and_then(|p| p.changed.clone());
        signal.is_some_and(|s| s.disconnect(subscription))
    }
}

impl std::fmt::Debug for PropertySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let props = self.props.borrow();
        f.debug_map()
            .entries(props.iter().map(|p| (&p.name, &p.value)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn declare_is_idempotent_per_name() {
        let set = PropertySet::new();
        let a = set.declare("speed", 1.5);
        let b = set.declare("speed", 9);
        assert_eq!(a, b);
        assert_eq!(set.get(a), Some(PropertyValue::Float(1.5)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn set_reports_kind_changes_and_notifies() {
        let set = PropertySet::new();
        let id = set.declare("count", 3);
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        set.on_changed(id, move |_| h.set(h.get() + 1)).unwrap();

        assert_eq!(set.set(id, 3), SetOutcome::Unchanged);
        assert_eq!(set.set(id, 4), SetOutcome::Value);
        assert_eq!(set.set(id, 4.0), SetOutcome::Kind);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn constants_have_no_notifier() {
        let set = PropertySet::new();
        let id = set.declare_constant("label", 2);
        assert!(!set.has_notifier(id));
        assert!(set.on_changed(id, |_| {}).is_none());
    }

    #[test]
    fn scalar_conversions() {
        assert_eq!(PropertyValue::Bool(true).to_i32(), Some(1));
        assert_eq!(PropertyValue::Float(2.9).to_i32(), Some(2));
        assert_eq!(PropertyValue::Int(7).to_f32(), Some(7.0));
        assert_eq!(PropertyValue::from("x").to_f32(), None);
        assert_eq!(PropertyValue::Invalid.to_i32(), None);
    }
}
