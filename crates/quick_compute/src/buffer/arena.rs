use std::cell::{Ref, RefCell, RefMut};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use super::{BufferKind, ShaderBuffer, TextureFormat};
use crate::error::BufferError;
use crate::rhi::PresentedTexture;
use crate::signal::{Signal, SubscriptionId};

/// Generation-checked reference to a buffer stored in a [`BufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    fn stale(self) -> BufferError {
        BufferError::StaleHandle {
            index: self.index,
            generation: self.generation,
        }
    }
}

/// Identity of a compute unit as seen from the buffers it owns.
///
/// Buffers hold only a weak reference to the token, so an owner that has been
/// dropped is observed as "no owner" without any explicit detach.
#[derive(Debug)]
pub struct OwnerToken {
    pub unit_id: u64,
}

struct Entry {
    buffer: ShaderBuffer,
    changed: Rc<Signal<()>>,
    owner: Weak<OwnerToken>,
    presented: Weak<PresentedTexture>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Storage for every buffer declared in one scope.
///
/// All methods take `&self`; internal borrows are released before change
/// notifications fire, so subscribers may read the arena again.
#[derive(Default)]
pub struct BufferArena {
    slots: RefCell<Vec<Slot>>,
    free: RefCell<Vec<u32>>,
}

impl BufferArena {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn insert(&self, buffer: impl Into<ShaderBuffer>) -> BufferHandle {
        let entry = Entry {
            buffer: buffer.into(),
            changed: Rc::new(Signal::new()),
            owner: Weak::new(),
            presented: Weak::new(),
        };

        let mut slots = self.slots.borrow_mut();
        if let Some(index) = self.free.borrow_mut().pop() {
            let slot = &mut slots[index as usize];
            slot.entry = Some(entry);
            BufferHandle {
                index,
                generation: slot.generation,
            }
        } else {
            slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            BufferHandle {
                index: (slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// Destroys a buffer. Its owner is notified so it rebuilds without it;
    /// every outstanding handle becomes stale.
    pub fn remove(&self, handle: BufferHandle) -> Result<ShaderBuffer, BufferError> {
        let changed = self.entry(handle)?.changed.clone();
        changed.emit(&());

        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[handle.index as usize];
        let entry = slot.entry.take().ok_or_else(|| handle.stale())?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.borrow_mut().push(handle.index);
        Ok(entry.buffer)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.entry(handle).is_ok()
    }

    pub fn len(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|s| s.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self, handle: BufferHandle) -> Option<BufferKind> {
        self.entry(handle).ok().map(|e| e.buffer.kind())
    }

    /// Runs `f` against the stored buffer.
    pub fn with<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&ShaderBuffer) -> R,
    ) -> Result<R, BufferError> {
        let entry = self.entry(handle)?;
        Ok(f(&entry.buffer))
    }

    /// Returns a copy of the buffer's payload.
    pub fn payload(&self, handle: BufferHandle) -> Result<Vec<u8>, BufferError> {
        self.with(handle, |b| b.payload().to_vec())
    }

    /// Replaces the payload and notifies the owner if the bytes differ.
    pub fn set_payload(
        &self,
        handle: BufferHandle,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), BufferError> {
        let payload = payload.into();
        self.mutate(handle, |buffer| {
            let current = buffer.payload_mut();
            if *current == payload {
                return Ok(false);
            }
            *current = payload;
            Ok(true)
        })
    }

    pub fn set_image_size(
        &self,
        handle: BufferHandle,
        width: u32,
        height: u32,
    ) -> Result<(), BufferError> {
        self.mutate_image(handle, |img| {
            let changed = img.size != Some((width, height));
            img.size = Some((width, height));
            changed
        })
    }

    pub fn set_texture_format(
        &self,
        handle: BufferHandle,
        format: TextureFormat,
    ) -> Result<(), BufferError> {
        self.mutate_image(handle, |img| {
            let changed = img.format != format;
            img.format = format;
            changed
        })
    }

    pub fn set_image_source(
        &self,
        handle: BufferHandle,
        source: Option<PathBuf>,
    ) -> Result<(), BufferError> {
        self.mutate_image(handle, |img| {
            let changed = img.source != source;
            img.source = source;
            changed
        })
    }

    /// Subscribes to every mutation of the buffer.
    pub fn on_changed(
        &self,
        handle: BufferHandle,
        slot: impl Fn(&()) + 'static,
    ) -> Result<SubscriptionId, BufferError> {
        Ok(self.entry(handle)?.changed.connect(slot))
    }

    pub fn disconnect(&self, handle: BufferHandle, id: SubscriptionId) -> bool {
        self.entry(handle)
            .map(|e| e.changed.disconnect(id))
            .unwrap_or(false)
    }

    /// `true` while a live compute unit owns the buffer.
    pub fn owner_alive(&self, handle: BufferHandle) -> bool {
        self.entry(handle)
            .map(|e| e.owner.strong_count() > 0)
            .unwrap_or(false)
    }

    pub fn owner_id(&self, handle: BufferHandle) -> Option<u64> {
        self.entry(handle)
            .ok()
            .and_then(|e| e.owner.upgrade())
            .map(|t| t.unit_id)
    }

    /// Records `owner` as the buffer's owner. Fails if another live unit
    /// already owns it.
    pub fn set_owner(
        &self,
        handle: BufferHandle,
        owner: &Rc<OwnerToken>,
    ) -> Result<(), BufferError> {
        let mut entry = self.entry_mut(handle)?;
        if let Some(current) = entry.owner.upgrade() {
            if !Rc::ptr_eq(&current, owner) {
                return Err(BufferError::AlreadyOwned);
            }
        }
        entry.owner = Rc::downgrade(owner);
        Ok(())
    }

    /// Clears the back-reference if it still points at `owner`.
    pub fn clear_owner(&self, handle: BufferHandle, owner: &Rc<OwnerToken>) {
        if let Ok(mut entry) = self.entry_mut(handle) {
            if entry.owner.upgrade().is_some_and(|o| Rc::ptr_eq(&o, owner)) {
                entry.owner = Weak::new();
            }
        }
    }

    /// The texture published by the owner's last successful build, if it is
    /// still alive.
    pub fn presented_texture(&self, handle: BufferHandle) -> Option<Rc<PresentedTexture>> {
        self.entry(handle).ok().and_then(|e| e.presented.upgrade())
    }

    pub(crate) fn set_presented_texture(
        &self,
        handle: BufferHandle,
        texture: &Rc<PresentedTexture>,
    ) -> Result<(), BufferError> {
        let mut entry = self.entry_mut(handle)?;
        if entry.buffer.kind() != BufferKind::Image {
            return Err(BufferError::NotAnImage);
        }
        entry.presented = Rc::downgrade(texture);
        Ok(())
    }

    fn mutate(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&mut ShaderBuffer) -> Result<bool, BufferError>,
    ) -> Result<(), BufferError> {
        let signal = {
            let mut entry = self.entry_mut(handle)?;
            if !f(&mut entry.buffer)? {
                return Ok(());
            }
            entry.changed.clone()
        };
        signal.emit(&());
        Ok(())
    }

    fn mutate_image(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&mut super::ImageBuffer) -> bool,
    ) -> Result<(), BufferError> {
        self.mutate(handle, |buffer| {
            let img = buffer.as_image_mut().ok_or(BufferError::NotAnImage)?;
            Ok(f(img))
        })
    }

    fn entry(&self, handle: BufferHandle) -> Result<Ref<'_, Entry>, BufferError> {
        Ref::filter_map(self.slots.borrow(), |slots| {
            slots
                .get(handle.index as usize)
                .filter(|s| s.generation == handle.generation)
                .and_then(|s| s.entry.as_ref())
        })
        .map_err(|_| handle.stale())
    }

    fn entry_mut(&self, handle: BufferHandle) -> Result<RefMut<'_, Entry>, BufferError> {
        RefMut::filter_map(self.slots.borrow_mut(), |slots| {
            slots
                .get_mut(handle.index as usize)
                .filter(|s| s.generation == handle.generation)
                .and_then(|s| s.entry.as_mut())
        })
        .map_err(|_| handle.stale())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ImageBuffer, StorageBuffer};
    use std::cell::Cell;

    #[test]
    fn removed_handles_become_stale_and_slots_are_reused() {
        let arena = BufferArena::new();
        let a = arena.insert(StorageBuffer::new(vec![1, 2, 3]));
        arena.remove(a).unwrap();
        assert!(!arena.contains(a));
        assert!(matches!(
            arena.payload(a),
            Err(BufferError::StaleHandle { .. })
        ));

        let b = arena.insert(StorageBuffer::new(vec![9]));
        assert_ne!(a, b);
        assert!(arena.contains(b));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn payload_change_notifies_only_on_difference() {
        let arena = BufferArena::new();
        let h = arena.insert(StorageBuffer::new(vec![0u8; 4]));
        let hits = Rc::new(Cell::new(0));
        let c = hits.clone();
        arena.on_changed(h, move |_| c.set(c.get() + 1)).unwrap();

        arena.set_payload(h, vec![0u8; 4]).unwrap();
        assert_eq!(hits.get(), 0);
        arena.set_payload(h, vec![1u8; 4]).unwrap();
        assert_eq!(hits.get(), 1);
        arena.set_image_size(h, 2, 2).unwrap_err();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn subscribers_may_read_the_arena_while_notified() {
        let arena = BufferArena::new();
        let h = arena.insert(ImageBuffer::new());
        let seen = Rc::new(Cell::new(0usize));
        let (a, s) = (Rc::downgrade(&arena), seen.clone());
        arena
            .on_changed(h, move |_| {
                if let Some(arena) = a.upgrade() {
                    s.set(arena.payload(h).map(|p| p.len()).unwrap_or(0));
                }
            })
            .unwrap();

        arena.set_payload(h, vec![7u8; 16]).unwrap();
        assert_eq!(seen.get(), 16);
    }

    #[test]
    fn owner_is_exclusive_and_weak() {
        let arena = BufferArena::new();
        let h = arena.insert(StorageBuffer::new(vec![1]));
        let first = Rc::new(OwnerToken { unit_id: 1 });
        let second = Rc::new(OwnerToken { unit_id: 2 });

        arena.set_owner(h, &first).unwrap();
        assert_eq!(arena.set_owner(h, &second), Err(BufferError::AlreadyOwned));
        assert_eq!(arena.owner_id(h), Some(1));

        drop(first);
        assert!(!arena.owner_alive(h));
        arena.set_owner(h, &second).unwrap();
        assert_eq!(arena.owner_id(h), Some(2));
    }
}
