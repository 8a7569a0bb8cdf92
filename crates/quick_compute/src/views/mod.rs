//! Scene items that present compute results.
//!
//! Views never own the compute unit they show. They hold a weak reference,
//! subscribe to its completion signal and refresh their node at the next
//! synchronization after a dispatch.

mod point_cloud;
mod texture;

pub use self::point_cloud::{PointCloudNode, PointCloudUniforms, PointCloudView, MIN_STRIDE};
pub use self::texture::TextureView;

use std::cell::Cell;
use std::rc::Rc;

use crate::compute_unit::{ComputeUnit, WeakComputeUnit};
use crate::signal::SubscriptionId;

/// Weak link from a view to its compute unit plus the completion
/// subscription that marks the view dirty.
#[derive(Debug, Default)]
struct UnitLink {
    unit: WeakComputeUnit,
    subscription: Option<SubscriptionId>,
    dirty: Rc<Cell<bool>>,
}

impl UnitLink {
    fn set(&mut self, unit: &ComputeUnit) -> bool {
        if self.unit.ptr_eq(unit) {
            return false;
        }
        self.clear();
        let dirty = Rc::downgrade(&self.dirty);
        self.subscription = Some(unit.on_completed(move |_| {
            if let Some(d) = dirty.upgrade() {
                d.set(true);
            }
        }));
        self.unit = unit.downgrade();
        self.dirty.set(true);
        true
    }

    fn clear(&mut self) {
        if let (Some(unit), Some(sub)) = (self.unit.upgrade(), self.subscription.take()) {
            unit.disconnect_completed(sub);
        }
        self.unit = WeakComputeUnit::new();
    }

    fn get(&self) -> Option<ComputeUnit> {
        self.unit.upgrade()
    }

    fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    fn take_dirty(&self) -> bool {
        self.dirty.replace(false)
    }
}

impl Drop for UnitLink {
    fn drop(&mut self) {
        self.clear();
    }
}
