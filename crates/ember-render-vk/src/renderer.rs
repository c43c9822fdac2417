// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use ember_render::{RenderSettings, RenderSize, Renderer, SurfaceProvider};
use tracing::{info, warn};

use crate::config::{ContextConfig, ContextFlags};
use crate::context::VulkanContext;
use crate::error::{FrameError, PresentStatus};

const PRESENT_FLAGS: ContextFlags = ContextFlags::PRESENT_MAILBOX
    .union(ContextFlags::PRESENT_FIFO_RELAXED)
    .union(ContextFlags::PRESENT_IMMEDIATE);

/// Clears the surface every frame through a [`VulkanContext`].
pub struct VkRenderer {
    ctx: VulkanContext,
    clear: [f32; 4],
    size: RenderSize,
    paused: bool,
    /// Present flags from the settings, restored when vsync goes back on.
    preferred_present: ContextFlags,
    needs_recreate: bool,
}

impl VkRenderer {
    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut VulkanContext {
        &mut self.ctx
    }

    /// A failed rebuild leaves `needs_recreate` set, so `render` retries the
    /// rebuild instead of drawing.
    fn recreate(&mut self) -> Result<()> {
        self.needs_recreate = true;
        self.ctx
            .recreate_swapchain(self.size)
            .context("recreate swapchain")?;
        self.needs_recreate = false;
        let extent = self.ctx.swapchain_extent();
        info!(
            "vk: swapchain recreated {}x{} ({} images)",
            extent.width,
            extent.height,
            self.ctx.swapchain_image_count()
        );
        Ok(())
    }

    fn handle_frame_error(&mut self, err: FrameError) -> Result<()> {
        if err.is_recoverable() {
            self.recreate()
        } else {
            Err(err).context("frame")
        }
    }
}

impl Renderer for VkRenderer {
    fn new(surface: &dyn SurfaceProvider, settings: &RenderSettings) -> Result<Self> {
        let size = surface.size();
        let config = ContextConfig::from_settings("ember", settings);
        let preferred_present = config.flags & PRESENT_FLAGS;
        let ctx = VulkanContext::create(config, surface).context("vulkan init")?;
        let extent = ctx.swapchain_extent();
        info!(
            "vk: ready {}x{}, {:?}, {} images, {} frames in flight",
            extent.width,
            extent.height,
            ctx.present_mode(),
            ctx.swapchain_image_count(),
            ctx.inflight_frames()
        );
        Ok(Self {
            ctx,
            clear: settings.clear_color,
            size,
            paused: size.is_zero(),
            preferred_present,
            needs_recreate: false,
        })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_zero() {
            if !self.paused {
                info!("vk: resize to 0x0 → paused=true");
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            info!("vk: resize to {}x{} → paused=false", size.width, size.height);
        }
        self.paused = false;
        self.size = size;
        self.recreate()
    }

    fn reinit_surface(&mut self, surface: &dyn SurfaceProvider) -> Result<()> {
        let size = surface.size();
        self.ctx.reinit_surface(surface).context("reinit surface")?;
        self.size = size;
        self.paused = size.is_zero();
        info!("vk: surface reinitialized {}x{}", size.width, size.height);
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        let present = if on {
            // FIFO_RELAXED and IMMEDIATE may tear
            self.preferred_present & ContextFlags::PRESENT_MAILBOX
        } else {
            ContextFlags::PRESENT_IMMEDIATE | ContextFlags::PRESENT_MAILBOX
        };
        let flags = (self.ctx.flags() - PRESENT_FLAGS) | present;
        if flags != self.ctx.flags() {
            self.ctx.set_flags(flags);
            self.needs_recreate = true;
        }
    }

    fn render(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        if self.needs_recreate {
            self.recreate()?;
        }

        if let Err(e) = self.ctx.begin_frame() {
            // Skip this frame after recreating; the next one will draw.
            return self.handle_frame_error(e);
        }

        let clear = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        self.ctx.begin_surface_render_pass(clear)?;
        self.ctx.end_surface_render_pass()?;

        match self.ctx.end_frame() {
            Ok(PresentStatus::Optimal) => Ok(()),
            Ok(PresentStatus::Suboptimal) => {
                warn!("vk: present reported suboptimal swapchain");
                self.recreate()
            }
            Err(e) => self.handle_frame_error(e),
        }
    }
}
