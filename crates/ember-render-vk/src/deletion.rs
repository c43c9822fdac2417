// SPDX-License-Identifier: CEPL-1.0
//! Deferred destruction of GPU objects.
//!
//! Requests land in a global list that any thread may append to. At the end of
//! a frame the list is stamped with that frame's submission generation and
//! moved into the slot that was just submitted. When the slot comes round
//! again its fence wait retires the generation, and only then are the objects
//! released.

use std::sync::Arc;

use ash::khr::swapchain;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use tracing::trace;

/// A GPU object waiting to be destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingDestroy {
    Image(vk::Image),
    ImageView(vk::ImageView),
    Buffer(vk::Buffer),
    BufferView(vk::BufferView),
    Memory(vk::DeviceMemory),
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    PipelineCache(vk::PipelineCache),
    ShaderModule(vk::ShaderModule),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    CommandPool(vk::CommandPool),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    Swapchain(vk::SwapchainKHR),
}

impl PendingDestroy {
    pub fn is_null(&self) -> bool {
        match *self {
            PendingDestroy::Image(h) => h.is_null(),
            PendingDestroy::ImageView(h) => h.is_null(),
            PendingDestroy::Buffer(h) => h.is_null(),
            PendingDestroy::BufferView(h) => h.is_null(),
            PendingDestroy::Memory(h) => h.is_null(),
            PendingDestroy::Sampler(h) => h.is_null(),
            PendingDestroy::Pipeline(h) => h.is_null(),
            PendingDestroy::PipelineLayout(h) => h.is_null(),
            PendingDestroy::PipelineCache(h) => h.is_null(),
            PendingDestroy::ShaderModule(h) => h.is_null(),
            PendingDestroy::DescriptorPool(h) => h.is_null(),
            PendingDestroy::DescriptorSetLayout(h) => h.is_null(),
            PendingDestroy::RenderPass(h) => h.is_null(),
            PendingDestroy::Framebuffer(h) => h.is_null(),
            PendingDestroy::CommandPool(h) => h.is_null(),
            PendingDestroy::Fence(h) => h.is_null(),
            PendingDestroy::Semaphore(h) => h.is_null(),
            PendingDestroy::Swapchain(h) => h.is_null(),
        }
    }
}

/// Something that can actually destroy objects.
pub trait Release {
    /// Destroys `object`. Null handles must be ignored.
    fn release(&self, object: PendingDestroy);
}

/// The live device behind the `Release` and `AttachmentFactory` seams.
pub struct DeviceOps<'a> {
    pub device: &'a ash::Device,
    pub swapchain: Option<&'a swapchain::Device>,
}

impl Release for DeviceOps<'_> {
    fn release(&self, object: PendingDestroy) {
        if object.is_null() {
            return;
        }
        let d = self.device;
        // SAFETY: callers only hand over objects created from `d` that no
        // pending GPU work references any more.
        unsafe {
            match object {
                PendingDestroy::Image(h) => d.destroy_image(h, None),
                PendingDestroy::ImageView(h) => d.destroy_image_view(h, None),
                PendingDestroy::Buffer(h) => d.destroy_buffer(h, None),
                PendingDestroy::BufferView(h) => d.destroy_buffer_view(h, None),
                PendingDestroy::Memory(h) => d.free_memory(h, None),
                PendingDestroy::Sampler(h) => d.destroy_sampler(h, None),
                PendingDestroy::Pipeline(h) => d.destroy_pipeline(h, None),
                PendingDestroy::PipelineLayout(h) => d.destroy_pipeline_layout(h, None),
                PendingDestroy::PipelineCache(h) => d.destroy_pipeline_cache(h, None),
                PendingDestroy::ShaderModule(h) => d.destroy_shader_module(h, None),
                PendingDestroy::DescriptorPool(h) => d.destroy_descriptor_pool(h, None),
                PendingDestroy::DescriptorSetLayout(h) => {
                    d.destroy_descriptor_set_layout(h, None)
                }
                PendingDestroy::RenderPass(h) => d.destroy_render_pass(h, None),
                PendingDestroy::Framebuffer(h) => d.destroy_framebuffer(h, None),
                PendingDestroy::CommandPool(h) => d.destroy_command_pool(h, None),
                PendingDestroy::Fence(h) => d.destroy_fence(h, None),
                PendingDestroy::Semaphore(h) => d.destroy_semaphore(h, None),
                PendingDestroy::Swapchain(h) => {
                    if let Some(sc) = self.swapchain {
                        sc.destroy_swapchain(h, None);
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Stamped {
    object: PendingDestroy,
    generation: u64,
}

/// Cloneable, thread-safe handle onto the global deletion list.
#[derive(Clone, Default)]
pub struct DeletionHandle {
    global: Arc<Mutex<Vec<PendingDestroy>>>,
}

impl DeletionHandle {
    /// Queues `object` for destruction once every frame that may still use it
    /// has retired. Only enqueue after the last command referencing it has been
    /// recorded.
    pub fn enqueue(&self, object: PendingDestroy) {
        if object.is_null() {
            return;
        }
        self.global.lock().push(object);
    }

    pub fn len(&self) -> usize {
        self.global.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Global list plus one list per frame slot.
pub struct DeletionQueue {
    global: DeletionHandle,
    per_frame: Vec<Vec<Stamped>>,
}

impl DeletionQueue {
    pub fn new(slots: usize) -> Self {
        Self {
            global: DeletionHandle::default(),
            per_frame: (0..slots).map(|_| Vec::new()).collect(),
        }
    }

    pub fn handle(&self) -> DeletionHandle {
        self.global.clone()
    }

    pub fn enqueue(&self, object: PendingDestroy) {
        self.global.enqueue(object);
    }

    /// Moves everything in the global list into `slot`'s list, tagged with the
    /// generation of the submission that slot just made.
    pub fn promote(&mut self, slot: usize, generation: u64) {
        let taken = std::mem::take(&mut *self.global.global.lock());
        if taken.is_empty() {
            return;
        }
        trace!("deferring {} deletions to slot {slot} (gen {generation})", taken.len());
        self.per_frame[slot].extend(taken.into_iter().map(|object| Stamped { object, generation }));
    }

    /// Releases every request in `slot`'s list whose generation has retired.
    /// Returns how many objects were destroyed.
    pub fn drain(&mut self, slot: usize, retired: u64, releaser: &impl Release) -> usize {
        let list = &mut self.per_frame[slot];
        let before = list.len();
        list.retain(|s| {
            if s.generation <= retired {
                releaser.release(s.object);
                false
            } else {
                true
            }
        });
        before - list.len()
    }

    /// Releases everything, including the global list. Only valid once the
    /// device is idle.
    pub fn drain_all(&mut self, releaser: &impl Release) -> usize {
        let mut n = 0;
        for list in &mut self.per_frame {
            n += list.len();
            for s in list.drain(..) {
                releaser.release(s.object);
            }
        }
        let global = std::mem::take(&mut *self.global.global.lock());
        n += global.len();
        for object in global {
            releaser.release(object);
        }
        n
    }

    pub fn pending_in_slot(&self, slot: usize) -> usize {
        self.per_frame[slot].len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.per_frame.iter().all(Vec::is_empty)
    }
}
