//! Host render surface: frame-phase hooks, deferred render jobs and the
//! per-frame sequence.
//!
//! Everything here runs on the single render thread. Hooks and jobs receive
//! the frame's [`GraphicsDevice`]; they are the only place GPU work happens.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::rhi::GraphicsDevice;
use crate::scene::SceneGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramePhase {
    /// Before items synchronize their scene nodes.
    BeforeSynchronizing,
    /// After synchronization, before the render pass is recorded.
    BeforeRendering,
}

impl FramePhase {
    fn index(self) -> usize {
        match self {
            FramePhase::BeforeSynchronizing => 0,
            FramePhase::BeforeRendering => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Disconnected right before its first invocation.
    Once,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type Hook = Rc<dyn Fn(&mut dyn GraphicsDevice)>;

/// Work deferred to a later phase. Runs exactly once.
pub type RenderJob = Box<dyn FnOnce(&mut dyn GraphicsDevice)>;

struct HookEntry {
    id: HookId,
    phase: FramePhase,
    mode: HookMode,
    owner: u64,
    hook: Hook,
}

/// A window as seen by the core.
pub struct RenderSurface {
    hooks: RefCell<Vec<HookEntry>>,
    next_hook: Cell<u64>,
    jobs: [RefCell<Vec<RenderJob>>; 2],
    update_requested: Cell<bool>,
    size: Cell<(u32, u32)>,
    device_pixel_ratio: Cell<f32>,
    closed: Cell<bool>,
}

impl RenderSurface {
    /// Creates a surface of `width`×`height` logical pixels and registers it
    /// in the [`WindowList`].
    pub fn new(width: u32, height: u32, device_pixel_ratio: f32) -> Rc<Self> {
        let surface = Rc::new(Self {
            hooks: RefCell::new(Vec::new()),
            next_hook: Cell::new(1),
            jobs: [RefCell::new(Vec::new()), RefCell::new(Vec::new())],
            update_requested: Cell::new(false),
            size: Cell::new((width, height)),
            device_pixel_ratio: Cell::new(device_pixel_ratio),
            closed: Cell::new(false),
        });
        WindowList::register(&surface);
        surface
    }

    pub fn size(&self) -> (u32, u32) {
        self.size.get()
    }

    pub fn set_size(&self, width: u32, height: u32) {
        self.size.set((width, height));
    }

    pub fn device_pixel_ratio(&self) -> f32 {
        self.device_pixel_ratio.get()
    }

    pub fn set_device_pixel_ratio(&self, dpr: f32) {
        self.device_pixel_ratio.set(dpr);
    }

    /// Size of the framebuffer in physical pixels.
    pub fn pixel_size(&self) -> (f32, f32) {
        let (w, h) = self.size();
        let dpr = self.device_pixel_ratio();
        (w as f32 * dpr, h as f32 * dpr)
    }

    /// Marks the surface closed; it is no longer discoverable.
    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Asks the host for another frame.
    pub fn request_update(&self) {
        self.update_requested.set(true);
    }

    /// Returns and clears the pending update request.
    pub fn take_update_request(&self) -> bool {
        self.update_requested.replace(false)
    }

    pub fn connect(
        &self,
        phase: FramePhase,
        mode: HookMode,
        owner: u64,
        hook: impl Fn(&mut dyn GraphicsDevice) + 'static,
    ) -> HookId {
        let id = HookId(self.next_hook.get());
        self.next_hook.set(id.0 + 1);
        self.hooks.borrow_mut().push(HookEntry {
            id,
            phase,
            mode,
            owner,
            hook: Rc::new(hook),
        });
        id
    }

    pub fn disconnect(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.borrow_mut();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    /// Removes every hook registered by `owner`.
    pub fn disconnect_owner(&self, owner: u64) -> usize {
        let mut hooks = self.hooks.borrow_mut();
        let before = hooks.len();
        hooks.retain(|h| h.owner != owner);
        before - hooks.len()
    }

    pub fn is_connected(&self, id: HookId) -> bool {
        self.hooks.borrow().iter().any(|h| h.id == id)
    }

    pub fn hook_count(&self, phase: FramePhase) -> usize {
        self.hooks
            .borrow()
            .iter()
            .filter(|h| h.phase == phase)
            .count()
    }

    /// Invokes the hooks of `phase` that were connected before this call.
    ///
    /// A hook disconnected by an earlier hook of the same emission is skipped.
    pub fn emit(&self, phase: FramePhase, device: &mut dyn GraphicsDevice) {
        let ids: Vec<HookId> = self
            .hooks
            .borrow()
            .iter()
            .filter(|h| h.phase == phase)
            .map(|h| h.id)
            .collect();

        for id in ids {
            let hook = {
                let mut hooks = self.hooks.borrow_mut();
                let Some(pos) = hooks.iter().position(|h| h.id == id) else {
                    continue;
                };
                match hooks[pos].mode {
                    HookMode::Once => hooks.remove(pos).hook,
                    HookMode::Persistent => hooks[pos].hook.clone(),
                }
            };
            hook(device);
        }
    }

    /// Queues `job` to run at the next drain of `phase`.
    pub fn schedule_render_job(&self, phase: FramePhase, job: RenderJob) {
        self.jobs[phase.index()].borrow_mut().push(job);
    }

    pub fn pending_jobs(&self, phase: FramePhase) -> usize {
        self.jobs[phase.index()].borrow().len()
    }

    /// Runs the jobs queued for `phase`. Jobs queued while draining run at
    /// the next drain.
    pub fn run_render_jobs(&self, phase: FramePhase, device: &mut dyn GraphicsDevice) {
        let jobs = std::mem::take(&mut *self.jobs[phase.index()].borrow_mut());
        if !jobs.is_empty() {
            log::debug!("running {} render job(s) at {phase:?}", jobs.len());
        }
        for job in jobs {
            job(device);
        }
    }

    /// Records one frame.
    pub fn render_frame(&self, device: &mut dyn GraphicsDevice, scene: &mut SceneGraph) {
        self.run_render_jobs(FramePhase::BeforeSynchronizing, device);
        self.emit(FramePhase::BeforeSynchronizing, device);

        scene.synchronize(device);

        self.run_render_jobs(FramePhase::BeforeRendering, device);
        self.emit(FramePhase::BeforeRendering, device);

        scene.prepare(self, device);
        device.command_buffer().begin_render_pass();
        scene.render(self, device);
        device.command_buffer().end_render_pass();
    }
}

impl std::fmt::Debug for RenderSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSurface")
            .field("size", &self.size.get())
            .field("dpr", &self.device_pixel_ratio.get())
            .field("hooks", &self.hooks.borrow().len())
            .field("closed", &self.closed.get())
            .finish()
    }
}

thread_local! {
    static WINDOWS: RefCell<Vec<Weak<RenderSurface>>> = const { RefCell::new(Vec::new()) };
}

/// Render-thread-wide list of open surfaces.
pub struct WindowList;

impl WindowList {
    fn register(surface: &Rc<RenderSurface>) {
        WINDOWS.with(|w| {
            let mut windows = w.borrow_mut();
            windows.retain(|s| s.strong_count() > 0);
            windows.push(Rc::downgrade(surface));
        });
    }

    /// The first surface that is still alive and open.
    pub fn first_live() -> Option<Rc<RenderSurface>> {
        WINDOWS.with(|w| {
            w.borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .find(|s| !s.is_closed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::RecordingDevice;

    #[test]
    fn once_hooks_fire_a_single_time() {
        let surface = RenderSurface::new(100, 100, 1.0);
        let mut device = RecordingDevice::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        surface.connect(FramePhase::BeforeRendering, HookMode::Once, 1, move |_| {
            h.set(h.get() + 1)
        });
        surface.emit(FramePhase::BeforeSynchronizing, &mut device);
        surface.emit(FramePhase::BeforeRendering, &mut device);
        surface.emit(FramePhase::BeforeRendering, &mut device);
        assert_eq!(hits.get(), 1);
        assert_eq!(surface.hook_count(FramePhase::BeforeRendering), 0);
    }

    #[test]
    fn hooks_added_during_emit_wait_for_next_emit() {
        let surface = RenderSurface::new(10, 10, 1.0);
        let mut device = RecordingDevice::new();
        let hits = Rc::new(Cell::new(0));

        let (s, h) = (Rc::downgrade(&surface), hits.clone());
        surface.connect(FramePhase::BeforeRendering, HookMode::Once, 1, move |_| {
            let h = h.clone();
            if let Some(s) = s.upgrade() {
                s.connect(FramePhase::BeforeRendering, HookMode::Once, 1, move |_| {
                    h.set(h.get() + 1)
                });
            }
        });
        surface.emit(FramePhase::BeforeRendering, &mut device);
        assert_eq!(hits.get(), 0);
        surface.emit(FramePhase::BeforeRendering, &mut device);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn disconnect_owner_removes_only_that_owner() {
        let surface = RenderSurface::new(10, 10, 1.0);
        surface.connect(FramePhase::BeforeRendering, HookMode::Persistent, 1, |_| {});
        surface.connect(FramePhase::BeforeSynchronizing, HookMode::Once, 1, |_| {});
        let kept = surface.connect(FramePhase::BeforeRendering, HookMode::Persistent, 2, |_| {});
        assert_eq!(surface.disconnect_owner(1), 2);
        assert!(surface.is_connected(kept));
    }

    #[test]
    fn jobs_scheduled_while_draining_run_next_time() {
        let surface = RenderSurface::new(10, 10, 1.0);
        let mut device = RecordingDevice::new();
        let hits = Rc::new(Cell::new(0));

        let (s, h) = (Rc::downgrade(&surface), hits.clone());
        surface.schedule_render_job(
            FramePhase::BeforeSynchronizing,
            Box::new(move |_| {
                h.set(h.get() + 1);
                let h = h.clone();
                if let Some(s) = s.upgrade() {
                    s.schedule_render_job(
                        FramePhase::BeforeSynchronizing,
                        Box::new(move |_| h.set(h.get() + 10)),
                    );
                }
            }),
        );
        surface.run_render_jobs(FramePhase::BeforeSynchronizing, &mut device);
        assert_eq!(hits.get(), 1);
        assert_eq!(surface.pending_jobs(FramePhase::BeforeSynchronizing), 1);
        surface.run_render_jobs(FramePhase::BeforeSynchronizing, &mut device);
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn closed_and_dropped_surfaces_are_not_discovered() {
        let first = RenderSurface::new(10, 10, 1.0);
        let second = RenderSurface::new(20, 20, 2.0);
        first.close();
        let found = WindowList::first_live().unwrap();
        assert!(Rc::ptr_eq(&found, &second));

        drop(found);
        drop(second);
        assert!(WindowList::first_live().is_none());
    }

    #[test]
    fn update_request_is_consumed() {
        let surface = RenderSurface::new(1, 1, 1.0);
        assert!(!surface.take_update_request());
        surface.request_update();
        assert!(surface.take_update_request());
        assert!(!surface.take_update_request());
    }
}
