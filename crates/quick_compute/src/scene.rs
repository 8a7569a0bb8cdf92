//! Retained scene graph: items produce nodes during synchronization, nodes
//! record GPU commands during the frame.

use std::any::Any;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use glam::{Mat4, Vec3};

use crate::rhi::{CommandBuffer, Filter, GraphicsDevice, PresentedTexture};
use crate::surface::RenderSurface;

/// Axis-aligned rectangle in logical window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderingFlags: u32 {
        /// The node only draws inside its item's rectangle.
        const BOUNDED_RECT_RENDERING = 1 << 0;
        /// The node writes depth consistently with the scene.
        const DEPTH_AWARE_RENDERING = 1 << 1;
        /// The node only uses the device given to it.
        const NO_EXTERNAL_RENDERING = 1 << 2;
    }
}

/// Per-node transform and window information for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub projection: Mat4,
    pub model_view: Mat4,
    pub window_size: (u32, u32),
    pub device_pixel_ratio: f32,
    pub item_rect: Rect,
}

impl RenderState {
    pub fn new(surface: &RenderSurface, item_rect: Rect) -> Self {
        let (w, h) = surface.size();
        Self {
            projection: Mat4::orthographic_rh(0.0, w as f32, h as f32, 0.0, -1.0, 1.0),
            model_view: Mat4::from_translation(Vec3::new(item_rect.x, item_rect.y, 0.0)),
            window_size: (w, h),
            device_pixel_ratio: surface.device_pixel_ratio(),
            item_rect,
        }
    }

    pub fn mvp(&self) -> Mat4 {
        self.projection * self.model_view
    }
}

/// A node that records its own GPU commands.
pub trait RenderNode {
    /// Creates or updates resources. Runs before the render pass opens.
    fn prepare(&mut self, device: &mut dyn GraphicsDevice, state: &RenderState);

    /// Records draw commands inside the render pass.
    fn render(&mut self, commands: &mut dyn CommandBuffer, state: &RenderState);

    /// Drops every resource the node created.
    fn release_resources(&mut self, device: &mut dyn GraphicsDevice);

    fn flags(&self) -> RenderingFlags {
        RenderingFlags::empty()
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A quad showing one texture.
#[derive(Debug, Clone)]
pub struct TextureNode {
    texture: Weak<PresentedTexture>,
    filter: Filter,
    rect: Rect,
}

impl TextureNode {
    pub fn new(texture: &Rc<PresentedTexture>) -> Self {
        Self {
            texture: Rc::downgrade(texture),
            filter: Filter::Linear,
            rect: Rect::default(),
        }
    }

    pub fn set_texture(&mut self, texture: &Rc<PresentedTexture>) {
        self.texture = Rc::downgrade(texture);
    }

    pub fn texture(&self) -> Option<Rc<PresentedTexture>> {
        self.texture.upgrade()
    }

    pub fn set_filtering(&mut self, filter: Filter) {
        self.filter = filter;
    }

    pub fn filtering(&self) -> Filter {
        self.filter
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.rect = rect;
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }
}

pub enum SceneNode {
    Texture(TextureNode),
    Custom(Box<dyn RenderNode>),
}

impl SceneNode {
    pub fn as_texture(&self) -> Option<&TextureNode> {
        match self {
            SceneNode::Texture(t) => Some(t),
            SceneNode::Custom(_) => None,
        }
    }

    pub fn as_custom<T: RenderNode + 'static>(&self) -> Option<&T> {
        match self {
            SceneNode::Custom(n) => n.as_any().downcast_ref(),
            SceneNode::Texture(_) => None,
        }
    }

    /// Releases a custom node's resources. Texture nodes own none.
    pub fn release_resources(&mut self, device: &mut dyn GraphicsDevice) {
        if let SceneNode::Custom(node) = self {
            node.release_resources(device);
        }
    }
}

impl std::fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneNode::Texture(t) => f.debug_tuple("Texture").field(t).finish(),
            SceneNode::Custom(n) => f.debug_tuple("Custom").field(&n.flags()).finish(),
        }
    }
}

/// A visual element that owns at most one scene node.
pub trait Item: Any {
    fn rect(&self) -> Rect;

    /// `true` when the item wants its node refreshed at the next sync.
    fn needs_update(&self) -> bool;

    /// Returns the node to keep. `old` is the node returned last time.
    fn update_paint_node(
        &mut self,
        old: Option<SceneNode>,
        device: &mut dyn GraphicsDevice,
    ) -> Option<SceneNode>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(usize);

struct ItemSlot {
    item: Box<dyn Item>,
    node: Option<SceneNode>,
    synced: bool,
}

/// Items of one window in paint order.
#[derive(Default)]
pub struct SceneGraph {
    slots: Vec<Option<ItemSlot>>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: impl Item) -> ItemId {
        self.slots.push(Some(ItemSlot {
            item: Box::new(item),
            node: None,
            synced: false,
        }));
        ItemId(self.slots.len() - 1)
    }

    /// Removes an item and releases its node's resources.
    pub fn remove(&mut self, id: ItemId, device: &mut dyn GraphicsDevice) -> Option<Box<dyn Item>> {
        let mut slot = self.slots.get_mut(id.0)?.take()?;
        if let Some(node) = slot.node.as_mut() {
            node.release_resources(device);
        }
        Some(slot.item)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item<T: Item>(&self, id: ItemId) -> Option<&T> {
        self.slot(id)?.item.as_any().downcast_ref()
    }

    pub fn item_mut<T: Item>(&mut self, id: ItemId) -> Option<&mut T> {
        self.slots
            .get_mut(id.0)?
            .as_mut()?
            .item
            .as_any_mut()
            .downcast_mut()
    }

    pub fn node(&self, id: ItemId) -> Option<&SceneNode> {
        self.slot(id)?.node.as_ref()
    }

    fn slot(&self, id: ItemId) -> Option<&ItemSlot> {
        self.slots.get(id.0)?.as_ref()
    }

    /// Lets every new or dirty item refresh its node.
    pub fn synchronize(&mut self, device: &mut dyn GraphicsDevice) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.synced && !slot.item.needs_update() {
                continue;
            }
            let old = slot.node.take();
            slot.node = slot.item.update_paint_node(old, device);
            slot.synced = true;
        }
    }

    pub fn prepare(&mut self, surface: &RenderSurface, device: &mut dyn GraphicsDevice) {
        for slot in self.slots.iter_mut().flatten() {
            if let Some(SceneNode::Custom(node)) = slot.node.as_mut() {
                let state = RenderState::new(surface, slot.item.rect());
                node.prepare(device, &state);
            }
        }
    }

    pub fn render(&mut self, surface: &RenderSurface, device: &mut dyn GraphicsDevice) {
        for slot in self.slots.iter_mut().flatten() {
            match slot.node.as_mut() {
                Some(SceneNode::Texture(node)) => {
                    if let Some(texture) = node.texture() {
                        device.command_buffer().draw_texture(
                            texture.rhi_texture(),
                            node.filtering(),
                            node.rect(),
                        );
                    }
                }
                Some(SceneNode::Custom(node)) => {
                    let state = RenderState::new(surface, slot.item.rect());
                    node.render(device.command_buffer(), &state);
                }
                None => {}
            }
        }
    }

    /// Releases the resources of every node, keeping the items.
    pub fn release_all(&mut self, device: &mut dyn GraphicsDevice) {
        for slot in self.slots.iter_mut().flatten() {
            if let Some(mut node) = slot.node.take() {
                node.release_resources(device);
            }
            slot.synced = false;
        }
    }
}
