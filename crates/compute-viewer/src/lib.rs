// src/lib.rs
//! Windowed host for compute scenes.
//!
//! Provides a wgpu implementation of the scene library's graphics device and
//! drives a loaded scene from a winit event loop.

pub mod app;
pub mod config;
pub mod renderer;
