use std::any::Any;

use log::warn;

use super::UnitLink;
use crate::buffer::{BufferHandle, BufferKind};
use crate::compute_unit::ComputeUnit;
use crate::rhi::{Filter, GraphicsDevice};
use crate::scene::{Item, Rect, SceneNode, TextureNode};

/// Shows one image buffer of a compute unit as a linear-filtered quad.
#[derive(Debug, Default)]
pub struct TextureView {
    link: UnitLink,
    image: Option<BufferHandle>,
    rect: Rect,
}

impl TextureView {
    pub fn new(rect: Rect) -> Self {
        Self {
            rect,
            ..Self::default()
        }
    }

    pub fn compute_unit(&self) -> Option<ComputeUnit> {
        self.link.get()
    }

    pub fn set_compute_unit(&mut self, unit: &ComputeUnit) {
        self.link.set(unit);
    }

    pub fn image_buffer(&self) -> Option<BufferHandle> {
        self.image
    }

    /// Binds the image buffer to show. Refused for handles that do not name
    /// an image in the unit's arena.
    pub fn set_image_buffer(&mut self, handle: BufferHandle) -> bool {
        if let Some(unit) = self.link.get() {
            if unit.arena().kind(handle) != Some(BufferKind::Image) {
                warn!("TextureView needs an image buffer");
                return false;
            }
        }
        if self.image != Some(handle) {
            self.image = Some(handle);
            self.link.mark_dirty();
        }
        true
    }

    pub fn set_rect(&mut self, rect: Rect) {
        if rect != self.rect {
            self.rect = rect;
            self.link.mark_dirty();
        }
    }
}

impl Item for TextureView {
    fn rect(&self) -> Rect {
        self.rect
    }

    fn needs_update(&self) -> bool {
        self.link.is_dirty()
    }

    fn update_paint_node(
        &mut self,
        old: Option<SceneNode>,
        _device: &mut dyn GraphicsDevice,
    ) -> Option<SceneNode> {
        self.link.take_dirty();

        let Some(unit) = self.link.get() else {
            warn!("Cannot render without compute unit");
            return old;
        };
        let Some(image) = self.image else {
            warn!("Cannot render without result buffer");
            return old;
        };
        let Some(texture) = unit.arena().presented_texture(image) else {
            warn!("Cannot render without texture");
            return old;
        };

        let mut node = match old {
            Some(SceneNode::Texture(node)) => node,
            _ => TextureNode::new(&texture),
        };
        node.set_texture(&texture);
        node.set_filtering(Filter::Linear);
        node.set_rect(self.rect);
        Some(SceneNode::Texture(node))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::buffer::{BufferArena, ImageBuffer, StorageBuffer, TextureFormat};
    use crate::rhi::{PresentedTexture, RecordingDevice, TextureDesc, TextureUsage};

    #[test]
    fn keeps_old_node_until_a_texture_exists() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        let image = arena.insert(ImageBuffer::new().with_size(2, 2));
        unit.attach(image);

        let mut view = TextureView::new(Rect::new(0.0, 0.0, 10.0, 10.0));
        view.set_compute_unit(&unit);
        assert!(view.set_image_buffer(image));
        assert!(view.needs_update());

        let mut device = RecordingDevice::new();
        assert!(view.update_paint_node(None, &mut device).is_none());
        assert!(!view.needs_update());
    }

    #[test]
    fn keeps_old_node_without_a_result_buffer() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        let image = arena.insert(ImageBuffer::new().with_size(1, 1));
        let mut device = RecordingDevice::new();
        let texture = device
            .create_texture(&TextureDesc {
                label: "shown".into(),
                format: TextureFormat::Rgba8,
                width: 1,
                height: 1,
                usage: TextureUsage::SAMPLED,
            })
            .unwrap();
        let presented = Rc::new(PresentedTexture::new(texture, 1, 1, TextureFormat::Rgba8));
        arena.set_presented_texture(image, &presented).unwrap();

        let mut view = TextureView::new(Rect::new(0.0, 0.0, 4.0, 4.0));
        view.set_compute_unit(&unit);
        assert!(view.update_paint_node(None, &mut device).is_none());

        assert!(view.set_image_buffer(image));
        let node = view.update_paint_node(None, &mut device);
        assert!(matches!(node, Some(SceneNode::Texture(_))));
    }

    #[test]
    fn refuses_storage_buffers() {
        let arena = BufferArena::new();
        let unit = ComputeUnit::with_surface(&arena, None);
        let storage = arena.insert(StorageBuffer::new(vec![1, 2, 3, 4]));
        let mut view = TextureView::default();
        view.set_compute_unit(&unit);
        assert!(!view.set_image_buffer(storage));
        assert_eq!(view.image_buffer(), None);
    }
}
