use crate::{config::Config, renderer::Renderer};
use anyhow::{Context, Result};
use quick_compute::scene::Rect;
use quick_compute::{RenderSurface, Scene};
use std::rc::Rc;
use std::sync::Arc;
use winit::{dpi::PhysicalSize, event::WindowEvent, window::Window};

/// Logical size of a physical window size at `scale`.
fn logical_size(size: PhysicalSize<u32>, scale: f64) -> (u32, u32) {
    let logical = size.to_logical::<f64>(scale);
    (logical.width.round() as u32, logical.height.round() as u32)
}

pub struct App {
    pub renderer: Renderer,
    pub surface: Rc<RenderSurface>,
    pub scene: Scene,
}

impl App {
    pub async fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        let renderer = Renderer::new(window.clone(), config.low_power).await?;

        let scale = window.scale_factor();
        let (width, height) = logical_size(renderer.gfx.size, scale);
        let surface = RenderSurface::new(width, height, scale as f32);

        let scene = Scene::load(
            &config.scene,
            Some(surface.clone()),
            Rect::new(0.0, 0.0, width as f32, height as f32),
        )
        .with_context(|| format!("loading scene {}", config.scene.display()))?;

        let units = scene.units().count();
        log::info!(
            "Loaded {} compute unit(s) and {} view(s) from {}",
            units,
            scene.views().len(),
            config.scene.display()
        );

        // the first frame builds and dispatches every unit
        surface.request_update();

        Ok(Self {
            renderer,
            surface,
            scene,
        })
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>, scale: f64) {
        if new_size.width > 0 && new_size.height > 0 {
            self.renderer.resize(new_size);
            let (width, height) = logical_size(new_size, scale);
            self.surface.set_size(width, height);
            self.surface.set_device_pixel_ratio(scale as f32);
            self.surface.request_update();
        }
    }

    /// Handles window events the app cares about. Returns `true` if consumed.
    pub fn handle_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::Resized(physical_size) => {
                self.resize(*physical_size, window.scale_factor());
                false
            }
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                self.resize(window.inner_size(), *scale_factor);
                true
            }
            _ => false,
        }
    }

    /// `true` if a unit or a resize asked for another frame.
    pub fn wants_redraw(&self) -> bool {
        self.surface.take_update_request()
    }

    pub fn render(&mut self) -> Result<(), wgpu::SurfaceError> {
        self.renderer.render(&self.surface, self.scene.graph_mut())
    }

    /// Releases scene resources while the device is still alive.
    pub fn shutdown(&mut self) {
        self.surface.close();
        self.scene.graph_mut().release_all(&mut self.renderer.device);
    }
}
