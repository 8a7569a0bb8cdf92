//! The compute unit: owns a compute pipeline, the GPU mirrors of its attached
//! buffers and the frame hooks that dispatch it.
//!
//! A unit binds to the first live [`RenderSurface`] when it is created. Without
//! one it stays uninitialized and every dispatch request only warns. All GPU
//! work happens inside the surface's frame-phase hooks:
//!
//! * at the first `BeforeSynchronizing` after construction the pipeline is
//!   built and dispatched once;
//! * [`ComputeUnit::compute_once`] and [`ComputeUnit::compute_continuously`]
//!   register `BeforeRendering` hooks that rebuild a stale pipeline and then
//!   dispatch.
//!
//! Attaching or mutating a buffer, changing the shader path or changing the
//! uniform layout marks the unit stale; the rebuild happens right before the
//! next dispatch.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::buffer::{BufferArena, BufferHandle, ImageBuffer, OwnerToken, ShaderBuffer, StorageBuffer, TextureFormat};
use crate::error::BuildError;
use crate::image_source::{ImageCrateDecoder, ImageDecoder};
use crate::properties::{
    PropertyId, PropertySet, PropertyValue, SetOutcome, COMPUTE_SHADER, DISPATCH_X, DISPATCH_Y,
    DISPATCH_Z,
};
use crate::rhi::{
    BufferDesc, BufferType, BufferUsage, GraphicsDevice, PresentedTexture, ResourceUpdateBatch,
    RhiBindings, RhiBuffer, RhiComputePipeline, RhiResource, ShaderResourceBinding, ShaderStages,
    TextureDesc, TextureUsage,
};
use crate::shader::ShaderBytecode;
use crate::signal::{Signal, SubscriptionId};
use crate::surface::{FramePhase, HookId, HookMode, RenderSurface, WindowList};
use crate::uniforms::UniformReflector;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing has been built yet.
    Uninitialized,
    Built,
    /// Built, but inputs changed since; rebuilt before the next dispatch.
    Stale,
}

struct Builtins {
    shader: PropertyId,
    x: PropertyId,
    y: PropertyId,
    z: PropertyId,
}

/// GPU-side state of one unit.
struct UnitState {
    attached: Vec<BufferHandle>,
    subscriptions: Vec<(BufferHandle, SubscriptionId)>,
    rhi_buffers: Vec<Option<RhiBuffer>>,
    textures: Vec<Option<Rc<PresentedTexture>>>,

    reflector: Rc<RefCell<UniformReflector>>,
    decoder: Rc<dyn ImageDecoder>,

    component_complete: bool,
    pipeline_built: bool,
    running: bool,
    has_errors: bool,

    initial_updates: Option<ResourceUpdateBatch>,
    uniform_buffer: Option<RhiBuffer>,
    bindings: Option<RhiBindings>,
    pipeline: Option<RhiComputePipeline>,
    continuous_hook: Option<HookId>,
}

impl UnitState {
    /// Takes the resources only the unit itself uses.
    fn take_pool(&mut self) -> Vec<RhiResource> {
        self.initial_updates = None;
        let mut pool = Vec::with_capacity(3);
        pool.extend(self.pipeline.take().map(RhiResource::from));
        pool.extend(self.bindings.take().map(RhiResource::from));
        pool.extend(self.uniform_buffer.take().map(RhiResource::from));
        pool
    }

    /// Takes the mirrors views may still be drawing. The mirror lists keep
    /// their length.
    fn take_mirrors(&mut self) -> (Vec<RhiBuffer>, Vec<Rc<PresentedTexture>>) {
        let buffers = self.rhi_buffers.iter_mut().filter_map(Option::take).collect();
        let textures = self.textures.iter_mut().filter_map(Option::take).collect();
        (buffers, textures)
    }
}

struct Inner {
    id: u64,
    owner: Rc<OwnerToken>,
    arena: Rc<BufferArena>,
    surface: Weak<RenderSurface>,
    initialized: bool,
    properties: PropertySet,
    builtins: Builtins,
    dirty: Cell<bool>,
    completed: Signal<()>,
    state: RefCell<UnitState>,
}

/// Handle to a compute unit. Clones share the unit; GPU resources are
/// released when the last clone is dropped.
#[derive(Clone)]
pub struct ComputeUnit {
    inner: Rc<Inner>,
}

/// Non-owning reference to a [`ComputeUnit`].
#[derive(Clone, Default)]
pub struct WeakComputeUnit {
    inner: Weak<Inner>,
}

impl WeakComputeUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) -> Option<ComputeUnit> {
        self.inner.upgrade().map(|inner| ComputeUnit { inner })
    }

    pub fn ptr_eq(&self, unit: &ComputeUnit) -> bool {
        Weak::ptr_eq(&self.inner, &Rc::downgrade(&unit.inner))
    }
}

impl std::fmt::Debug for WeakComputeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.upgrade() {
            Some(inner) => write!(f, "WeakComputeUnit({})", inner.id),
            None => f.write_str("WeakComputeUnit(dead)"),
        }
    }
}

impl ComputeUnit {
    /// Creates a unit bound to the first live render surface.
    pub fn new(arena: &Rc<BufferArena>) -> Self {
        Self::with_surface(arena, WindowList::first_live())
    }

    /// Creates a unit bound to `surface`. `None` leaves the unit permanently
    /// uninitialized.
    pub fn with_surface(arena: &Rc<BufferArena>, surface: Option<Rc<RenderSurface>>) -> Self {
        let id = NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed);
        let properties = PropertySet::new();
        let builtins = Builtins {
            shader: properties.declare(COMPUTE_SHADER, ""),
            x: properties.declare(DISPATCH_X, 1),
            y: properties.declare(DISPATCH_Y, 1),
            z: properties.declare(DISPATCH_Z, 1),
        };

        if surface.is_none() {
            warn!("No render surface found; cannot init compute unit {id}");
        }

        let unit = Self {
            inner: Rc::new(Inner {
                id,
                owner: Rc::new(OwnerToken { unit_id: id }),
                arena: arena.clone(),
                surface: surface.as_ref().map(Rc::downgrade).unwrap_or_default(),
                initialized: surface.is_some(),
                properties,
                builtins,
                dirty: Cell::new(false),
                completed: Signal::new(),
                state: RefCell::new(UnitState {
                    attached: Vec::new(),
                    subscriptions: Vec::new(),
                    rhi_buffers: Vec::new(),
                    textures: Vec::new(),
                    reflector: Rc::new(RefCell::new(UniformReflector::default())),
                    decoder: Rc::new(ImageCrateDecoder),
                    component_complete: false,
                    pipeline_built: false,
                    running: false,
                    has_errors: false,
                    initial_updates: None,
                    uniform_buffer: None,
                    bindings: None,
                    pipeline: None,
                    continuous_hook: None,
                }),
            }),
        };

        unit.connect_hook(FramePhase::BeforeSynchronizing, HookMode::Once, |inner, device| {
            inner.rebuild(device);
            inner.run_dispatch(device, false);
        });
        unit
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakComputeUnit {
        WeakComputeUnit {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn arena(&self) -> &Rc<BufferArena> {
        &self.inner.arena
    }

    /// `true` once a live render surface was found at construction.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().running
    }

    pub fn has_errors(&self) -> bool {
        self.inner.state.borrow().has_errors
    }

    pub fn pipeline_state(&self) -> PipelineState {
        if !self.inner.state.borrow().pipeline_built {
            PipelineState::Uninitialized
        } else if self.inner.dirty.get() {
            PipelineState::Stale
        } else {
            PipelineState::Built
        }
    }

    // ----- buffer registry -------------------------------------------------

    /// Appends `handle` and takes ownership of the buffer. Refused with a
    /// warning if the handle is stale or the buffer already has a live owner.
    pub fn attach(&self, handle: BufferHandle) -> bool {
        let inner = &self.inner;
        if !inner.arena.contains(handle) {
            warn!("Cannot attach a null buffer to compute unit {}", inner.id);
            return false;
        }
        if let Err(e) = inner.arena.set_owner(handle, &inner.owner) {
            warn!("Cannot attach buffer to compute unit {}: {e}", inner.id);
            return false;
        }
        if inner.state.borrow().attached.contains(&handle) {
            warn!("Buffer is already attached to compute unit {}", inner.id);
            return false;
        }

        let weak = Rc::downgrade(inner);
        let subscription = inner.arena.on_changed(handle, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.mark_stale();
            }
        });

        let mut state = inner.state.borrow_mut();
        state.attached.push(handle);
        state.rhi_buffers.push(None);
        state.textures.push(None);
        if let Ok(sub) = subscription {
            state.subscriptions.push((handle, sub));
        }
        drop(state);

        inner.mark_stale();
        true
    }

    /// Replaces the attached list. Buffers no longer listed lose this unit as
    /// their owner; the new list is attached in order under the rules of
    /// [`Self::attach`]. Returns how many were attached.
    pub fn set_buffers(&self, handles: &[BufferHandle]) -> usize {
        self.inner.detach_all();
        handles.iter().filter(|&&handle| self.attach(handle)).count()
    }

    /// Attached handles in attachment order.
    pub fn buffers(&self) -> Vec<BufferHandle> {
        self.inner.state.borrow().attached.clone()
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.state.borrow().attached.len()
    }

    pub fn buffer_at(&self, index: usize) -> Option<BufferHandle> {
        let state = self.inner.state.borrow();
        let found = state.attached.get(index).copied();
        if found.is_none() {
            warn!("Buffer index {index} out of range ({} attached)", state.attached.len());
        }
        found
    }

    /// GPU mirror of a storage buffer; `None` for images and before a build.
    pub fn rhi_buffer_at(&self, index: usize) -> Option<RhiBuffer> {
        let state = self.inner.state.borrow();
        match state.rhi_buffers.get(index) {
            Some(mirror) => *mirror,
            None => {
                warn!("Buffer index {index} out of range ({} attached)", state.attached.len());
                None
            }
        }
    }

    /// Presented texture of an image buffer; `None` for storage buffers and
    /// before a build.
    pub fn texture_at(&self, index: usize) -> Option<Rc<PresentedTexture>> {
        let state = self.inner.state.borrow();
        match state.textures.get(index) {
            Some(mirror) => mirror.clone(),
            None => {
                warn!("Texture index {index} out of range ({} attached)", state.attached.len());
                None
            }
        }
    }

    pub fn index_of(&self, handle: BufferHandle) -> Option<usize> {
        self.inner
            .state
            .borrow()
            .attached
            .iter()
            .position(|h| *h == handle)
    }

    // ----- properties --------------------------------------------------------

    pub fn properties(&self) -> &PropertySet {
        &self.inner.properties
    }

    /// Finalizes construction: reflects the uniform layout.
    pub fn complete(&self) {
        self.inner.state.borrow_mut().component_complete = true;
        self.inner.reflect();
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.borrow().component_complete
    }

    pub fn set_image_decoder(&self, decoder: impl ImageDecoder + 'static) {
        self.inner.state.borrow_mut().decoder = Rc::new(decoder);
    }

    pub fn compute_shader(&self) -> PathBuf {
        let value = self.inner.properties.get(self.inner.builtins.shader);
        PathBuf::from(value.as_ref().and_then(PropertyValue::as_text).unwrap_or_default())
    }

    pub fn set_compute_shader(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let text = path.to_string_lossy().into_owned();
        if self.inner.properties.set(self.inner.builtins.shader, text) != SetOutcome::Unchanged {
            self.inner.mark_stale();
        }
    }

    pub fn dispatch_x(&self) -> u32 {
        self.inner.dispatch_count(self.inner.builtins.x)
    }

    pub fn dispatch_y(&self) -> u32 {
        self.inner.dispatch_count(self.inner.builtins.y)
    }

    pub fn dispatch_z(&self) -> u32 {
        self.inner.dispatch_count(self.inner.builtins.z)
    }

    pub fn set_dispatch_x(&self, groups: u32) -> bool {
        self.inner.set_dispatch(self.inner.builtins.x, DISPATCH_X, groups)
    }

    pub fn set_dispatch_y(&self, groups: u32) -> bool {
        self.inner.set_dispatch(self.inner.builtins.y, DISPATCH_Y, groups)
    }

    pub fn set_dispatch_z(&self, groups: u32) -> bool {
        self.inner.set_dispatch(self.inner.builtins.z, DISPATCH_Z, groups)
    }

    /// Declares a notifying scalar property. After [`Self::complete`] this
    /// changes the uniform layout and marks the unit stale.
    pub fn declare_property(&self, name: &str, value: impl Into<PropertyValue>) -> PropertyId {
        let props = &self.inner.properties;
        let existing = props.find(name);
        let id = props.declare(name, value);
        if existing.is_none() && self.is_complete() {
            self.inner.reflect();
            self.inner.mark_stale();
        }
        id
    }

    /// Sets a declared property. Built-in names go through their typed
    /// setters; unknown names are refused with a warning.
    pub fn set_property(&self, name: &str, value: impl Into<PropertyValue>) -> bool {
        let value = value.into();
        match name {
            COMPUTE_SHADER => match value.as_text() {
                Some(path) => {
                    self.set_compute_shader(path);
                    true
                }
                None => {
                    warn!("{COMPUTE_SHADER} must be a path");
                    false
                }
            },
            DISPATCH_X | DISPATCH_Y | DISPATCH_Z => match value {
                PropertyValue::Int(v) if u32::try_from(v).is_ok_and(|v| v >= 1) => {
                    let v = v as u32;
                    match name {
                        DISPATCH_X => self.set_dispatch_x(v),
                        DISPATCH_Y => self.set_dispatch_y(v),
                        _ => self.set_dispatch_z(v),
                    }
                }
                _ => {
                    warn!("{name} must be an integer >= 1, got {value:?}");
                    false
                }
            },
            _ => {
                let Some(id) = self.inner.properties.find(name) else {
                    warn!("Unknown property '{name}' on compute unit {}", self.inner.id);
                    return false;
                };
                if self.inner.properties.set(id, value) == SetOutcome::Kind && self.is_complete() {
                    self.inner.reflect();
                    self.inner.mark_stale();
                }
                true
            }
        }
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.inner.properties.get_by_name(name)
    }

    /// Size in bytes of the reflected uniform block.
    pub fn uniform_buffer_size(&self) -> usize {
        self.inner.state.borrow().reflector.borrow().total_size()
    }

    pub fn uniform_reflector(&self) -> Rc<RefCell<UniformReflector>> {
        self.inner.state.borrow().reflector.clone()
    }

    // ----- dispatch ----------------------------------------------------------

    /// Dispatches once at the next `BeforeRendering`, rebuilding first if
    /// needed.
    pub fn compute_once(&self) {
        if !self.inner.initialized {
            warn!("Compute unit {} is not initialized", self.inner.id);
            return;
        }
        self.connect_hook(FramePhase::BeforeRendering, HookMode::Once, |inner, device| {
            inner.rebuild_if_needed(device);
            inner.run_dispatch(device, false);
        });
    }

    /// Dispatches every frame until [`Self::stop`]. No-op while running.
    pub fn compute_continuously(&self) {
        if !self.inner.initialized {
            warn!("Compute unit {} is not initialized", self.inner.id);
            return;
        }
        if self.inner.state.borrow().continuous_hook.is_some() {
            return;
        }
        let hook = self.connect_hook(FramePhase::BeforeRendering, HookMode::Persistent, |inner, device| {
            inner.rebuild_if_needed(device);
            inner.run_dispatch(device, true);
        });
        let mut state = self.inner.state.borrow_mut();
        state.continuous_hook = hook;
        state.running = hook.is_some();
        if let Some(surface) = self.inner.surface.upgrade() {
            surface.request_update();
        }
    }

    /// Cancels continuous dispatch. Pending one-shot requests still run.
    pub fn stop(&self) {
        if !self.inner.initialized {
            warn!("Compute unit {} is not initialized", self.inner.id);
            return;
        }
        let hook = {
            let mut state = self.inner.state.borrow_mut();
            state.running = false;
            state.continuous_hook.take()
        };
        if let (Some(hook), Some(surface)) = (hook, self.inner.surface.upgrade()) {
            surface.disconnect(hook);
        }
    }

    /// Subscribes to completed dispatches.
    pub fn on_completed(&self, slot: impl Fn(&()) + 'static) -> SubscriptionId {
        self.inner.completed.connect(slot)
    }

    pub fn disconnect_completed(&self, id: SubscriptionId) -> bool {
        self.inner.completed.disconnect(id)
    }

    fn connect_hook(
        &self,
        phase: FramePhase,
        mode: HookMode,
        step: fn(&Inner, &mut dyn GraphicsDevice),
    ) -> Option<HookId> {
        let surface = self.inner.surface.upgrade()?;
        let weak = Rc::downgrade(&self.inner);
        Some(surface.connect(phase, mode, self.inner.id, move |device| {
            if let Some(inner) = weak.upgrade() {
                step(&inner, device);
            }
        }))
    }
}

impl std::fmt::Debug for ComputeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeUnit")
            .field("id", &self.inner.id)
            .field("initialized", &self.inner.initialized)
            .field("state", &self.pipeline_state())
            .field("buffers", &self.buffer_count())
            .finish()
    }
}

impl Inner {
    fn mark_stale(&self) {
        if !self.dirty.replace(true) {
            debug!("compute unit {} marked stale", self.id);
        }
    }

    /// Empties the attached list. Mirrors of the old list go through the
    /// surface's job queue.
    fn detach_all(&self) {
        let (subscriptions, attached, buffers, textures) = {
            let mut state = self.state.borrow_mut();
            let (buffers, textures) = state.take_mirrors();
            state.rhi_buffers.clear();
            state.textures.clear();
            (
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.attached),
                buffers,
                textures,
            )
        };
        for (handle, sub) in subscriptions {
            self.arena.disconnect(handle, sub);
        }
        for handle in attached {
            self.arena.clear_owner(handle, &self.owner);
        }
        schedule_release(
            self.surface.upgrade(),
            buffers.into_iter().map(RhiResource::from).collect(),
            textures,
        );
        self.mark_stale();
    }

    fn dispatch_count(&self, id: PropertyId) -> u32 {
        match self.properties.get(id) {
            Some(PropertyValue::Int(v)) => u32::try_from(v).map_or(1, |v| v.max(1)),
            _ => 1,
        }
    }

    fn set_dispatch(&self, id: PropertyId, name: &str, groups: u32) -> bool {
        if groups < 1 {
            warn!("{name} must be >= 1, got {groups}");
            return false;
        }
        if groups > i32::MAX as u32 {
            warn!("{name} must fit a signed 32-bit int, got {groups}");
            return false;
        }
        self.properties.set(id, groups);
        true
    }

    /// Replaces the reflector with one built from the current property set.
    fn reflect(&self) {
        let old = self.state.borrow().reflector.clone();
        old.borrow_mut().untrack(&self.properties);
        let reflector = UniformReflector::reflect_and_track(&self.properties);
        debug!(
            "compute unit {}: {} uniform(s), {} bytes",
            self.id,
            reflector.borrow().entries().len(),
            reflector.borrow().total_size()
        );
        self.state.borrow_mut().reflector = reflector;
    }

    fn rebuild_if_needed(&self, device: &mut dyn GraphicsDevice) {
        let built = self.state.borrow().pipeline_built;
        if !built || self.dirty.get() {
            self.rebuild(device);
        }
    }

    /// Tears down whatever the previous build created and builds afresh.
    fn rebuild(&self, device: &mut dyn GraphicsDevice) {
        if !self.initialized {
            return;
        }
        if !self.state.borrow().component_complete {
            self.state.borrow_mut().component_complete = true;
            self.reflect();
        }
        self.release_resources(device);
        self.build(device);
    }

    /// Releases the unit-private pool now; mirrors that views may still draw
    /// this frame go through the surface's job queue.
    fn release_resources(&self, device: &mut dyn GraphicsDevice) {
        let (pool, buffers, textures) = {
            let mut state = self.state.borrow_mut();
            if !state.pipeline_built {
                return;
            }
            state.pipeline_built = false;
            let pool = state.take_pool();
            let (buffers, textures) = state.take_mirrors();
            (pool, buffers, textures)
        };
        for resource in pool {
            device.release(resource);
        }
        schedule_release(self.surface.upgrade(), buffers.into_iter().map(RhiResource::from).collect(), textures);
    }

    fn build(&self, device: &mut dyn GraphicsDevice) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.has_errors = false;

        let mut batch = device.next_resource_update_batch();
        let mut bindings = Vec::with_capacity(state.attached.len() + 1);
        let mut binding = 0u32;

        let uniform_size = state.reflector.borrow().total_size();
        if uniform_size > 0 {
            let desc = BufferDesc {
                label: format!("compute-unit-{}-uniforms", self.id),
                ty: BufferType::Dynamic,
                usage: BufferUsage::UNIFORM,
                size: uniform_size as u64,
            };
            match device.create_buffer(&desc) {
                Ok(buffer) => state.uniform_buffer = Some(buffer),
                Err(e) => {
                    warn!("compute unit {}: cannot create uniform buffer: {e}", self.id);
                    state.has_errors = true;
                }
            }
        }

        let count = state.attached.len();
        state.rhi_buffers = vec![None; count];
        state.textures = vec![None; count];

        for index in 0..count {
            let handle = state.attached[index];
            let buffer = match self.arena.with(handle, ShaderBuffer::clone) {
                Ok(buffer) => buffer,
                Err(source) => {
                    warn!("compute unit {}: {}", self.id, BuildError::Buffer { index, source });
                    state.has_errors = true;
                    continue;
                }
            };

            let built = match &buffer {
                ShaderBuffer::Storage(storage) => self
                    .build_storage(device, &mut batch, index, storage)
                    .map(|b| {
                        state.rhi_buffers[index] = Some(b);
                        ShaderResourceBinding::storage_buffer(binding, ShaderStages::COMPUTE, b)
                    }),
                ShaderBuffer::Image(image) => self
                    .build_image(device, &mut batch, index, image, state.decoder.as_ref())
                    .map(|texture| {
                        let entry = ShaderResourceBinding::storage_image(
                            binding,
                            ShaderStages::COMPUTE,
                            texture.rhi_texture(),
                        );
                        if let Err(e) = self.arena.set_presented_texture(handle, &texture) {
                            warn!("compute unit {}: buffer {index}: {e}", self.id);
                        }
                        state.textures[index] = Some(texture);
                        entry
                    }),
            };

            match built {
                Ok(entry) => {
                    bindings.push(entry);
                    binding += 1;
                }
                Err(e) => {
                    warn!("compute unit {}: {e}", self.id);
                    state.has_errors = true;
                }
            }
        }

        if let Some(uniform) = state.uniform_buffer {
            bindings.push(ShaderResourceBinding::uniform_buffer(
                binding,
                ShaderStages::COMPUTE,
                uniform,
            ));
        }

        match device.create_shader_resource_bindings(&bindings) {
            Ok(b) => {
                state.bindings = Some(b);
                let shader = ShaderBytecode::load(self.shader_path());
                match device.create_compute_pipeline(&shader, b) {
                    Ok(p) => state.pipeline = Some(p),
                    Err(e) => {
                        warn!("compute unit {}: cannot create compute pipeline: {e}", self.id);
                        state.has_errors = true;
                    }
                }
            }
            Err(e) => {
                warn!("compute unit {}: cannot create resource bindings: {e}", self.id);
                state.has_errors = true;
            }
        }

        state.initial_updates = Some(batch);
        state.pipeline_built = true;
        self.dirty.set(false);

        debug!(
            "compute unit {}: built {} binding(s){}",
            self.id,
            bindings.len(),
            if state.has_errors { " with errors" } else { "" }
        );
    }

    fn build_storage(
        &self,
        device: &mut dyn GraphicsDevice,
        batch: &mut ResourceUpdateBatch,
        index: usize,
        storage: &StorageBuffer,
    ) -> Result<RhiBuffer, BuildError> {
        let payload = storage.payload();
        if payload.is_empty() {
            return Err(BuildError::EmptyStorage { index });
        }
        let buffer = device.create_buffer(&BufferDesc {
            label: format!("compute-unit-{}-buffer-{index}", self.id),
            ty: BufferType::Immutable,
            usage: BufferUsage::STORAGE | BufferUsage::VERTEX,
            size: payload.len() as u64,
        })?;
        batch.upload_static_buffer(buffer, payload);
        Ok(buffer)
    }

    fn build_image(
        &self,
        device: &mut dyn GraphicsDevice,
        batch: &mut ResourceUpdateBatch,
        index: usize,
        image: &ImageBuffer,
        decoder: &dyn ImageDecoder,
    ) -> Result<Rc<PresentedTexture>, BuildError> {
        let (width, height, format, pixels) = if !image.payload().is_empty() {
            let (width, height) = image.size().unwrap_or((0, 0));
            let expected = image.expected_len().unwrap_or(0);
            if image.payload().len() != expected {
                return Err(BuildError::Buffer {
                    index,
                    source: crate::error::BufferError::SizeMismatch {
                        expected,
                        actual: image.payload().len(),
                        width,
                        height,
                        format: image.format(),
                    },
                });
            }
            (width, height, image.format(), image.payload().to_vec())
        } else if let Some(path) = image.source() {
            let decoded = decoder.decode(path).map_err(|source| BuildError::Decode {
                index,
                path: path.to_path_buf(),
                source,
            })?;
            (decoded.width, decoded.height, TextureFormat::Rgba8, decoded.pixels)
        } else {
            return Err(BuildError::NoImageData { index });
        };

        let texture = device.create_texture(&TextureDesc {
            label: format!("compute-unit-{}-image-{index}", self.id),
            format,
            width,
            height,
            usage: TextureUsage::LOAD_STORE | TextureUsage::SAMPLED,
        })?;
        batch.upload_texture(texture, width, height, pixels);
        Ok(Rc::new(PresentedTexture::new(texture, width, height, format)))
    }

    fn shader_path(&self) -> PathBuf {
        let value = self.properties.get(self.builtins.shader);
        PathBuf::from(value.as_ref().and_then(PropertyValue::as_text).unwrap_or_default())
    }

    /// Records one dispatch. Returns `false` when the unit cannot dispatch.
    fn run_dispatch(&self, device: &mut dyn GraphicsDevice, continuously: bool) -> bool {
        let dispatched = {
            let mut state = self.state.borrow_mut();
            if !self.initialized || !state.pipeline_built {
                warn!("Compute unit {} is not initialized", self.id);
                false
            } else if state.has_errors {
                warn!("Compute unit {}: build errors occurred, dispatch skipped", self.id);
                false
            } else if let (Some(pipeline), Some(bindings)) = (state.pipeline, state.bindings) {
                let mut batch = device.next_resource_update_batch();
                if let Some(initial) = state.initial_updates.take() {
                    batch.merge(initial);
                }
                if let Some(uniform) = state.uniform_buffer {
                    state.reflector.borrow().write_all(&mut batch, uniform);
                }

                let (x, y, z) = (
                    self.dispatch_count(self.builtins.x),
                    self.dispatch_count(self.builtins.y),
                    self.dispatch_count(self.builtins.z),
                );
                let cb = device.command_buffer();
                cb.begin_compute_pass(batch);
                cb.set_compute_pipeline(pipeline);
                cb.set_shader_resources(bindings);
                cb.dispatch(x, y, z);
                cb.end_compute_pass();

                if continuously {
                    state.running = true;
                    if let Some(surface) = self.surface.upgrade() {
                        surface.request_update();
                    }
                }
                true
            } else {
                false
            }
        };

        if dispatched {
            self.completed.emit(&());
        }
        dispatched
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (handle, sub) in state.subscriptions.drain(..) {
            self.arena.disconnect(handle, sub);
        }
        for &handle in &state.attached {
            self.arena.clear_owner(handle, &self.owner);
        }
        state.reflector.borrow_mut().untrack(&self.properties);

        let surface = self.surface.upgrade();
        if let Some(surface) = &surface {
            surface.disconnect_owner(self.id);
        }

        let mut resources = state.take_pool();
        let (buffers, textures) = state.take_mirrors();
        resources.extend(buffers.into_iter().map(RhiResource::from));
        schedule_release(surface, resources, textures);
    }
}

/// Hands `resources` and `textures` to the surface's `BeforeSynchronizing`
/// job queue. Without a surface there is no device left to release them on.
fn schedule_release(
    surface: Option<Rc<RenderSurface>>,
    resources: Vec<RhiResource>,
    textures: Vec<Rc<PresentedTexture>>,
) {
    if resources.is_empty() && textures.is_empty() {
        return;
    }
    match surface {
        Some(surface) => surface.schedule_render_job(
            FramePhase::BeforeSynchronizing,
            Box::new(move |device| {
                for resource in resources {
                    device.release(resource);
                }
                for texture in textures {
                    device.release(texture.rhi_texture().into());
                }
            }),
        ),
        None => debug!(
            "no live surface; dropping {} resource(s) without release",
            resources.len() + textures.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::buffer::StorageBuffer;
    use crate::image_source::DecodedImage;
    use crate::rhi::{Command, RecordingDevice};
    use crate::scene::SceneGraph;

    /// Hands out a fixed 2x2 RGBA8 image for every path.
    struct CheckerDecoder;

    impl ImageDecoder for CheckerDecoder {
        fn decode(&self, _path: &Path) -> Result<DecodedImage, image::ImageError> {
            Ok(DecodedImage {
                width: 2,
                height: 2,
                pixels: [[255, 255, 255, 255], [0, 0, 0, 255]].repeat(2).concat(),
            })
        }
    }

    fn count_completions(unit: &ComputeUnit) -> Rc<Cell<u32>> {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        unit.on_completed(move |_| c.set(c.get() + 1));
        count
    }

    fn shader_file(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("qc-unit-{tag}-{}.spv", std::process::id()));
        std::fs::write(&path, [0x03, 0x02, 0x23, 0x07]).unwrap();
        path
    }

    fn frame(surface: &RenderSurface, device: &mut RecordingDevice) {
        surface.render_frame(device, &mut SceneGraph::new());
    }

    #[test]
    fn unit_without_surface_stays_uninitialized() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        assert!(!unit.is_initialized());
        unit.compute_once();
        unit.compute_continuously();
        assert!(!unit.is_running());
        assert_eq!(unit.pipeline_state(), PipelineState::Uninitialized);
    }

    #[test]
    fn attach_refuses_owned_and_stale_buffers() {
        let surface = RenderSurface::new(8, 8, 1.0);
        let arena = BufferArena::new();
        let first = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        let second = ComputeUnit::with_surface(&arena, Some(surface));

        let buf = arena.insert(StorageBuffer::new(vec![0u8; 8]));
        assert!(first.attach(buf));
        assert!(!second.attach(buf));
        assert!(!first.attach(buf));
        assert_eq!(arena.owner_id(buf), Some(first.id()));
        assert_eq!(first.buffer_count(), 1);
        assert_eq!(second.buffer_count(), 0);

        let gone = arena.insert(StorageBuffer::new(vec![1]));
        arena.remove(gone).unwrap();
        assert!(!second.attach(gone));
    }

    #[test]
    fn dropping_a_unit_frees_its_buffers_for_others() {
        let arena = BufferArena::new();
        let buf = arena.insert(StorageBuffer::new(vec![0u8; 8]));
        let first = ComputeUnit::with_surface(&arena, Some(RenderSurface::new(1, 1, 1.0)));
        assert!(first.attach(buf));
        drop(first);

        let second = ComputeUnit::with_surface(&arena, Some(RenderSurface::new(1, 1, 1.0)));
        assert!(second.attach(buf));
    }

    #[test]
    fn out_of_range_lookups_return_none() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        assert!(unit.buffer_at(3).is_none());
        assert!(unit.rhi_buffer_at(0).is_none());
        assert!(unit.texture_at(0).is_none());
        assert_eq!(unit.index_of(arena.insert(StorageBuffer::new(vec![1]))), None);
    }

    #[test]
    fn dispatch_axes_are_independent() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        assert!(unit.set_dispatch_x(4));
        assert!(unit.set_dispatch_y(2));
        assert!(unit.set_dispatch_z(7));
        assert!(!unit.set_dispatch_z(0));
        assert_eq!((unit.dispatch_x(), unit.dispatch_y(), unit.dispatch_z()), (4, 2, 7));
        assert!(!unit.set_property(DISPATCH_Y, -3));
        assert_eq!(unit.dispatch_y(), 2);
    }

    #[test]
    fn first_frame_builds_and_dispatches_once() {
        let surface = RenderSurface::new(32, 32, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        let buf = arena.insert(StorageBuffer::new(vec![0u8; 64]));
        unit.attach(buf);
        unit.declare_property("time", 0.5);
        unit.set_compute_shader(shader_file("first"));
        unit.set_dispatch_x(3);
        unit.complete();

        frame(&surface, &mut device);
        frame(&surface, &mut device);

        assert_eq!(device.dispatch_count(), 1);
        assert!(device.commands().contains(&Command::Dispatch(3, 1, 1)));
        assert_eq!(unit.pipeline_state(), PipelineState::Built);
        assert!(!unit.has_errors());
        assert!(unit.rhi_buffer_at(0).is_some());
    }

    #[test]
    fn initial_uploads_are_merged_only_once() {
        let surface = RenderSurface::new(32, 32, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        unit.attach(arena.insert(StorageBuffer::new(vec![5u8; 16])));
        unit.declare_property("gain", 2);
        unit.set_compute_shader(shader_file("merge"));
        unit.complete();

        frame(&surface, &mut device);
        unit.compute_once();
        frame(&surface, &mut device);

        let passes: Vec<&ResourceUpdateBatch> = device
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::BeginComputePass(batch) => Some(batch),
                _ => None,
            })
            .collect();
        assert_eq!(passes.len(), 2);
        // static upload plus one uniform write, then the uniform write alone
        assert_eq!(passes[0].len(), 2);
        assert_eq!(passes[1].len(), 1);
    }

    #[test]
    fn mutation_marks_stale_and_rebuilds_before_next_dispatch() {
        let surface = RenderSurface::new(32, 32, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        let buf = arena.insert(StorageBuffer::new(vec![0u8; 16]));
        unit.attach(buf);
        unit.set_compute_shader(shader_file("stale"));
        unit.complete();
        frame(&surface, &mut device);
        let before = unit.rhi_buffer_at(0).unwrap();

        arena.set_payload(buf, vec![1u8; 32]).unwrap();
        assert_eq!(unit.pipeline_state(), PipelineState::Stale);

        unit.compute_once();
        frame(&surface, &mut device);
        let after = unit.rhi_buffer_at(0).unwrap();
        assert_ne!(before, after);
        assert_eq!(unit.pipeline_state(), PipelineState::Built);

        // old mirror is released at the start of the following frame
        assert!(device.is_live(before));
        frame(&surface, &mut device);
        assert!(!device.is_live(before));
    }

    #[test]
    fn missing_shader_sets_error_and_suppresses_dispatch() {
        let surface = RenderSurface::new(32, 32, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        unit.attach(arena.insert(StorageBuffer::new(vec![0u8; 16])));
        unit.set_compute_shader("/no/such/shader.spv");
        unit.complete();

        let completions = Rc::new(Cell::new(0));
        let c = completions.clone();
        unit.on_completed(move |_| c.set(c.get() + 1));

        frame(&surface, &mut device);
        assert!(unit.has_errors());
        assert_eq!(device.dispatch_count(), 0);
        assert_eq!(completions.get(), 0);

        // recovery only through an explicit rebuild
        unit.set_compute_shader(shader_file("recover"));
        unit.compute_once();
        frame(&surface, &mut device);
        assert!(!unit.has_errors());
        assert_eq!(completions.get(), 1);
    }

    #[test]
    fn drop_schedules_release_of_everything() {
        let surface = RenderSurface::new(32, 32, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        unit.attach(arena.insert(StorageBuffer::new(vec![0u8; 16])));
        unit.declare_property("k", 1);
        unit.set_compute_shader(shader_file("drop"));
        unit.complete();
        unit.compute_continuously();
        frame(&surface, &mut device);
        assert!(device.live_count() > 0);

        drop(unit);
        assert_eq!(surface.hook_count(FramePhase::BeforeRendering), 0);
        frame(&surface, &mut device);
        assert_eq!(device.live_count(), 0);
    }

    #[test]
    fn empty_uniform_block_is_not_bound() {
        let surface = RenderSurface::new(32, 32, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        unit.attach(arena.insert(StorageBuffer::new(vec![0u8; 16])));
        unit.set_compute_shader(shader_file("nouniform"));
        unit.complete();
        frame(&surface, &mut device);

        assert_eq!(unit.uniform_buffer_size(), 0);
        assert!(!unit.has_errors());
        assert_eq!(device.dispatch_count(), 1);
    }

    #[test]
    fn declaring_after_completion_relayouts_uniforms() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        unit.declare_property("a", 1.0);
        unit.complete();
        assert_eq!(unit.uniform_buffer_size(), 4);

        unit.declare_property("b", true);
        assert_eq!(unit.uniform_buffer_size(), 8);

        let b = unit.properties().find("b").unwrap();
        unit.set_property("b", false);
        assert_eq!(
            unit.uniform_reflector().borrow().entry_for(b).unwrap().as_i32(),
            0
        );
        unit.set_property("b", "text");
        assert_eq!(unit.uniform_buffer_size(), 4);
    }

    #[test]
    fn dispatch_counts_must_fit_a_signed_int() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        assert!(unit.set_dispatch_x(8));
        assert!(!unit.set_dispatch_x(3_000_000_000));
        assert_eq!(unit.dispatch_x(), 8);

        assert!(!unit.set_property(DISPATCH_X, 5_000_000_001i64));
        assert_eq!(unit.dispatch_x(), 8);
        assert!(unit.set_property(DISPATCH_X, i32::MAX as i64));
        assert_eq!(unit.dispatch_x(), i32::MAX as u32);
    }

    #[test]
    fn empty_storage_payload_is_a_build_error() {
        let surface = RenderSurface::new(8, 8, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        unit.attach(arena.insert(StorageBuffer::new(Vec::new())));
        unit.set_compute_shader(shader_file("empty"));
        unit.complete();
        let completions = count_completions(&unit);

        frame(&surface, &mut device);

        assert!(unit.has_errors());
        assert!(unit.rhi_buffer_at(0).is_none());
        assert_eq!(device.dispatch_count(), 0);
        assert_eq!(completions.get(), 0);
    }

    #[test]
    fn image_without_payload_or_source_is_a_build_error() {
        let surface = RenderSurface::new(8, 8, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        let storage = arena.insert(StorageBuffer::new(vec![0u8; 16]));
        unit.attach(storage);
        unit.attach(arena.insert(ImageBuffer::new().with_size(4, 4)));
        unit.set_compute_shader(shader_file("nodata"));
        unit.complete();

        frame(&surface, &mut device);

        assert!(unit.has_errors());
        assert!(unit.rhi_buffer_at(0).is_some());
        assert!(unit.texture_at(1).is_none());
        assert_eq!(device.dispatch_count(), 0);
    }

    #[test]
    fn image_source_is_decoded_to_rgba8() {
        let surface = RenderSurface::new(8, 8, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        unit.set_image_decoder(CheckerDecoder);
        let image = arena.insert(
            ImageBuffer::new()
                .with_format(TextureFormat::Rgba32F)
                .with_source("textures/checker.png"),
        );
        unit.attach(image);
        unit.set_compute_shader(shader_file("decode"));
        unit.complete();
        let completions = count_completions(&unit);

        frame(&surface, &mut device);

        assert!(!unit.has_errors());
        let texture = unit.texture_at(0).unwrap();
        assert_eq!(texture.size(), (2, 2));
        assert_eq!(texture.format(), TextureFormat::Rgba8);
        assert!(arena.presented_texture(image).is_some());
        assert_eq!(completions.get(), 1);
    }

    #[test]
    fn resetting_the_buffer_list_recovers_from_a_removed_buffer() {
        let surface = RenderSurface::new(8, 8, 1.0);
        let mut device = RecordingDevice::new();
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
        let a = arena.insert(StorageBuffer::new(vec![0u8; 16]));
        let b = arena.insert(StorageBuffer::new(vec![0u8; 16]));
        unit.attach(a);
        unit.attach(b);
        unit.set_compute_shader(shader_file("removed"));
        unit.complete();
        let completions = count_completions(&unit);
        frame(&surface, &mut device);
        assert_eq!(completions.get(), 1);
        let old_mirror = unit.rhi_buffer_at(1).unwrap();

        arena.remove(b).unwrap();
        unit.set_compute_shader(shader_file("removed-again"));
        unit.compute_once();
        frame(&surface, &mut device);
        assert!(unit.has_errors());
        assert_eq!(completions.get(), 1);

        assert_eq!(unit.set_buffers(&[a, b]), 1);
        assert_eq!(unit.buffers(), vec![a]);
        assert_eq!(unit.pipeline_state(), PipelineState::Stale);
        unit.compute_once();
        frame(&surface, &mut device);

        assert!(!unit.has_errors());
        assert_eq!(completions.get(), 2);
        assert!(unit.rhi_buffer_at(0).is_some());
        assert!(unit.rhi_buffer_at(1).is_none());
        assert_eq!(arena.owner_id(a), Some(unit.id()));
        assert!(!device.is_live(old_mirror));
    }

    #[test]
    fn set_buffers_hands_dropped_buffers_to_other_units() {
        let arena = BufferArena::new();
        let first = ComputeUnit::with_surface(&arena, None);
        let second = ComputeUnit::with_surface(&arena, None);
        let a = arena.insert(StorageBuffer::new(vec![1u8; 4]));
        let b = arena.insert(StorageBuffer::new(vec![2u8; 4]));
        assert_eq!(first.set_buffers(&[a, b]), 2);
        assert!(!second.attach(a));

        assert_eq!(first.set_buffers(&[b]), 1);
        assert_eq!(first.index_of(b), Some(0));
        assert!(second.attach(a));

        arena.set_payload(a, vec![9u8; 4]).unwrap();
        assert_eq!(first.buffer_count(), 1);
    }
}
