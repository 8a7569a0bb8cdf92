//! Owns the GPU context and the device the compute scene records into.

pub mod context;
pub mod pipelines;
pub mod wgpu_device;

use self::{context::GfxContext, wgpu_device::WgpuDevice};
use quick_compute::{RenderSurface, SceneGraph};
use std::sync::Arc;
use winit::window::Window;

pub struct Renderer {
    pub gfx: GfxContext,
    pub device: WgpuDevice,
}

impl Renderer {
    pub async fn new(window: Arc<Window>, low_power: bool) -> anyhow::Result<Self> {
        let gfx = GfxContext::new(window, low_power).await?;
        let device = WgpuDevice::new(gfx.device.clone(), gfx.queue.clone(), gfx.config.format);
        Ok(Self { gfx, device })
    }

    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        self.gfx.resize(new_size);
    }

    /// Records one frame of `graph` on `surface` and presents it.
    pub fn render(
        &mut self,
        surface: &RenderSurface,
        graph: &mut SceneGraph,
    ) -> Result<(), wgpu::SurfaceError> {
        let frame = self.gfx.surface.get_current_texture()?;
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        surface.render_frame(&mut self.device, graph);

        let (w, h) = surface.size();
        self.device.submit(
            &view,
            (self.gfx.config.width, self.gfx.config.height),
            (w as f32, h as f32),
        );
        frame.present();
        Ok(())
    }
}
