// SPDX-License-Identifier: CEPL-1.0
//! Fences, semaphores and image layout transitions.

use ash::vk;
use tracing::debug;

/// Access masks for moving an image between two layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub aspect: vk::ImageAspectFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Derives the barrier for `old -> new`. Pure; nothing is recorded.
pub fn layout_transition(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    aspect: vk::ImageAspectFlags,
) -> LayoutTransition {
    let mut src = vk::AccessFlags::empty();
    let mut dst = vk::AccessFlags::empty();

    // What has to be flushed from the old layout.
    match old {
        vk::ImageLayout::PRESENT_SRC_KHR => src |= vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => src |= vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            src |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            src |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => src |= vk::AccessFlags::TRANSFER_WRITE,
        _ => {}
    }

    // What becomes valid in the new layout.
    match new {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            if old == vk::ImageLayout::PREINITIALIZED {
                src |= vk::AccessFlags::HOST_WRITE;
            }
            dst |= vk::AccessFlags::TRANSFER_READ;
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => dst |= vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            if old != vk::ImageLayout::UNDEFINED {
                src |= vk::AccessFlags::TRANSFER_WRITE;
            }
            dst |= vk::AccessFlags::SHADER_READ;
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            dst |= vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            dst |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::PRESENT_SRC_KHR => dst |= vk::AccessFlags::MEMORY_READ,
        _ => {}
    }

    LayoutTransition {
        old_layout: old,
        new_layout: new,
        aspect,
        src_access: src,
        dst_access: dst,
    }
}

impl LayoutTransition {
    pub fn barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
    }
}

/// Records `old -> new` for `image` onto `cmd`.
///
/// # Safety
/// `cmd` must be in the recording state and belong to `device`.
pub unsafe fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let barrier = layout_transition(old, new, aspect).barrier(image);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
}

/// # Safety
/// `device` must be a live logical device.
pub unsafe fn create_fence(device: &ash::Device, presignalled: bool) -> ash::prelude::VkResult<vk::Fence> {
    let flags = if presignalled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
}

/// # Safety
/// `device` must be a live logical device.
pub unsafe fn create_semaphore(device: &ash::Device) -> ash::prelude::VkResult<vk::Semaphore> {
    unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
}

/// Blocks until `fence` signals, then resets it.
///
/// # Safety
/// `fence` must belong to `device`.
pub unsafe fn wait_and_reset_fence(device: &ash::Device, fence: vk::Fence) -> ash::prelude::VkResult<()> {
    unsafe {
        device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)?;
        device.reset_fences(std::slice::from_ref(&fence))
    }
}

/// The two semaphores shared by every frame slot: at most one acquire/present
/// pair is outstanding from the CPU's point of view.
#[derive(Clone, Copy, Debug, Default)]
pub struct PresentSync {
    pub acquire: vk::Semaphore,
    pub render_complete: vk::Semaphore,
}

impl PresentSync {
    /// # Safety
    /// `device` must be a live logical device.
    pub unsafe fn new(device: &ash::Device) -> ash::prelude::VkResult<Self> {
        let acquire = unsafe { create_semaphore(device)? };
        let render_complete = match unsafe { create_semaphore(device) } {
            Ok(s) => s,
            Err(e) => {
                unsafe { device.destroy_semaphore(acquire, None) };
                return Err(e);
            }
        };
        debug!("present semaphores created");
        Ok(Self {
            acquire,
            render_complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn present_to_color_flushes_memory_reads() {
        let t = layout_transition(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(t.src_access, vk::AccessFlags::MEMORY_READ);
        assert_eq!(
            t.dst_access,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn color_to_present() {
        let t = layout_transition(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(t.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(t.dst_access, vk::AccessFlags::MEMORY_READ);
    }

    #[test]
    fn undefined_sources_need_no_flush() {
        let t = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        assert!(t.src_access.is_empty());

        let depth = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        );
        assert!(depth.src_access.is_empty());
        assert!(depth
            .dst_access
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn upload_paths() {
        let to_dst = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let to_sampled = layout_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(to_sampled.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_sampled.dst_access, vk::AccessFlags::SHADER_READ);

        let from_host = layout_transition(
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(from_host.src_access, vk::AccessFlags::HOST_WRITE);
        assert_eq!(from_host.dst_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn barrier_carries_layouts_and_aspect() {
        let image = vk::Image::from_raw(0x42);
        let b = layout_transition(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        )
        .barrier(image);
        assert_eq!(b.image, image);
        assert_eq!(b.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(b.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(b.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(b.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.subresource_range.level_count, 1);
    }
}
