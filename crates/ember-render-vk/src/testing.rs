// SPDX-License-Identifier: CEPL-1.0
//! A fake device for exercising lifetime rules without a GPU.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;

use crate::deletion::{PendingDestroy, Release};
use crate::swapchain::AttachmentFactory;

/// Hands out unique fake handles, records every release in order and tracks
/// which views and framebuffers are still alive.
#[derive(Default)]
pub struct RecordingDevice {
    next: Cell<u64>,
    released: RefCell<Vec<PendingDestroy>>,
    views: RefCell<Vec<vk::ImageView>>,
    framebuffers: RefCell<HashMap<u64, vk::Extent2D>>,
    views_before_failure: Cell<Option<usize>>,
}

impl RecordingDevice {
    fn fresh(&self) -> u64 {
        let n = self.next.get() + 1;
        self.next.set(n);
        0x1000 + n
    }

    pub fn released(&self) -> Vec<PendingDestroy> {
        self.released.borrow().clone()
    }

    pub fn live_views(&self) -> usize {
        self.views.borrow().len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.borrow().len()
    }

    pub fn framebuffer_extent(&self, fb: vk::Framebuffer) -> Option<vk::Extent2D> {
        self.framebuffers.borrow().get(&fb.as_raw()).copied()
    }

    /// Lets `n` more image views succeed, then fails with out-of-memory.
    pub fn fail_views_after(&self, n: usize) {
        self.views_before_failure.set(Some(n));
    }

    pub fn fake_images(&self, n: usize) -> Vec<vk::Image> {
        (0..n).map(|_| vk::Image::from_raw(self.fresh())).collect()
    }
}

impl Release for RecordingDevice {
    fn release(&self, object: PendingDestroy) {
        if object.is_null() {
            return;
        }
        match object {
            PendingDestroy::ImageView(v) => self.views.borrow_mut().retain(|x| *x != v),
            PendingDestroy::Framebuffer(f) => {
                self.framebuffers.borrow_mut().remove(&f.as_raw());
            }
            _ => {}
        }
        self.released.borrow_mut().push(object);
    }
}

impl AttachmentFactory for RecordingDevice {
    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        if let Some(left) = self.views_before_failure.get() {
            if left == 0 {
                return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
            }
            self.views_before_failure.set(Some(left - 1));
        }
        let v = vk::ImageView::from_raw(self.fresh());
        self.views.borrow_mut().push(v);
        Ok(v)
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let raw = self.fresh();
        self.framebuffers.borrow_mut().insert(raw, extent);
        Ok(vk::Framebuffer::from_raw(raw))
    }
}
