// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Result};
use ember_render::{RenderSize, SurfaceProvider};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

pub use winit;

/// Exposes a winit window as a render surface.
pub struct WindowSurface<'a> {
    window: &'a winit::window::Window,
}

impl<'a> WindowSurface<'a> {
    pub fn new(window: &'a winit::window::Window) -> Self {
        Self { window }
    }
}

impl SurfaceProvider for WindowSurface<'_> {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        let dh = self
            .window
            .display_handle()
            .map_err(|e| anyhow!("display_handle: {e}"))?
            .as_raw();
        let wh = self
            .window
            .window_handle()
            .map_err(|e| anyhow!("window_handle: {e}"))?
            .as_raw();
        Ok((dh, wh))
    }

    fn size(&self) -> RenderSize {
        let s = self.window.inner_size();
        RenderSize {
            width: s.width,
            height: s.height,
        }
    }
}
