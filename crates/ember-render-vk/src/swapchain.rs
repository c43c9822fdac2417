// SPDX-License-Identifier: CEPL-1.0
//! Swapchain negotiation, per-image attachments and the surface render pass.

use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::vk;
use ember_render::RenderSize;
use tracing::{info, warn};

use crate::bootstrap::memory_type_from_properties;
use crate::config::ContextFlags;
use crate::deletion::{DeviceOps, PendingDestroy, Release};
use crate::sync::{transition_image_layout, PresentSync};

/// Format used when the surface has no preference.
pub const DEFAULT_SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// Creates the per-image objects that swapchain (re)creation needs. The live
/// device implements it, and so does the test fake.
pub trait AttachmentFactory {
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
}

impl AttachmentFactory for DeviceOps<'_> {
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&info, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }
    }
}

// --- negotiation -----------------------------------------------------------

/// Surface extent, or the window size (clamped to the surface limits) when
/// the surface leaves it to us.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width.max(caps.min_image_extent.width)),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height.max(caps.min_image_extent.height)),
    }
}

/// One pass over `modes`: the first mode the flags ask for wins, otherwise the
/// first mode listed.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], flags: ContextFlags) -> vk::PresentModeKHR {
    let mut chosen = modes.first().copied().unwrap_or(vk::PresentModeKHR::FIFO);
    for &mode in modes {
        let wanted = match mode {
            vk::PresentModeKHR::MAILBOX => flags.contains(ContextFlags::PRESENT_MAILBOX),
            vk::PresentModeKHR::FIFO_RELAXED => flags.contains(ContextFlags::PRESENT_FIFO_RELAXED),
            vk::PresentModeKHR::IMMEDIATE => flags.contains(ContextFlags::PRESENT_IMMEDIATE),
            _ => false,
        };
        if wanted {
            chosen = mode;
            break;
        }
    }
    chosen
}

/// One more than the minimum, capped by the maximum (0 == no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let fallback = vk::SurfaceFormatKHR {
        format: DEFAULT_SURFACE_FORMAT,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => fallback,
        [only] if only.format == vk::Format::UNDEFINED => vk::SurfaceFormatKHR {
            color_space: only.color_space,
            ..fallback
        },
        _ => formats
            .iter()
            .copied()
            .find(|f| {
                f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                    && (f.format == vk::Format::B8G8R8A8_UNORM
                        || f.format == vk::Format::R8G8B8A8_UNORM)
            })
            .unwrap_or(formats[0]),
    }
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    if caps
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
    {
        vk::CompositeAlphaFlagsKHR::OPAQUE
    } else {
        vk::CompositeAlphaFlagsKHR::INHERIT
    }
}

/// The result of negotiating with the surface.
#[derive(Clone, Copy, Debug, Default)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainPlan {
    pub fn negotiate(
        caps: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        modes: &[vk::PresentModeKHR],
        window: RenderSize,
        flags: ContextFlags,
    ) -> Self {
        Self {
            format: choose_surface_format(formats),
            present_mode: choose_present_mode(modes, flags),
            extent: choose_extent(caps, window),
            image_count: choose_image_count(caps),
            pre_transform: choose_pre_transform(caps),
            composite_alpha: choose_composite_alpha(caps),
        }
    }
}

fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

// --- owned objects ---------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct SwapchainImage {
    /// Owned by the swapchain; never destroyed on its own.
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DepthStencil {
    pub format: vk::Format,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

/// Everything that lives and dies with one swapchain.
#[derive(Debug, Default)]
pub struct SurfaceTargets {
    pub swapchain: vk::SwapchainKHR,
    pub plan: SwapchainPlan,
    pub images: Vec<SwapchainImage>,
    pub render_pass: vk::RenderPass,
    pub depth: Option<DepthStencil>,
}

impl SurfaceTargets {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Queries the surface and negotiates a plan.
///
/// # Safety
/// `surface` must be a live surface created from the instance behind `loader`.
pub unsafe fn query_plan(
    loader: &surface::Instance,
    physical: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    window: RenderSize,
    flags: ContextFlags,
) -> VkResult<SwapchainPlan> {
    let (caps, formats, modes) = unsafe {
        (
            loader.get_physical_device_surface_capabilities(physical, surface)?,
            loader.get_physical_device_surface_formats(physical, surface)?,
            loader.get_physical_device_surface_present_modes(physical, surface)?,
        )
    };
    let plan = SwapchainPlan::negotiate(&caps, &formats, &modes, window, flags);
    info!(
        "swapchain: format {:?} / {:?}, present_mode {}, extent {}x{}, images(min={} -> picked={})",
        plan.format.format,
        plan.format.color_space,
        present_mode_name(plan.present_mode),
        plan.extent.width,
        plan.extent.height,
        caps.min_image_count,
        plan.image_count,
    );
    Ok(plan)
}

/// Creates the swapchain for `plan` and returns it with its images.
///
/// # Safety
/// `surface` must be live and unused by any other swapchain.
pub unsafe fn create_swapchain(
    loader: &swapchain::Device,
    surface: vk::SurfaceKHR,
    plan: &SwapchainPlan,
    queue_families: [u32; 2],
) -> VkResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
    let mut info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(plan.image_count)
        .image_format(plan.format.format)
        .image_color_space(plan.format.color_space)
        .image_extent(plan.extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(plan.pre_transform)
        .composite_alpha(plan.composite_alpha)
        .present_mode(plan.present_mode)
        .clipped(true);
    // graphics and present on different families
    if queue_families[0] != queue_families[1] {
        info = info
            .image_sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(&queue_families);
    }
    unsafe {
        let handle = loader.create_swapchain(&info, None)?;
        match loader.get_swapchain_images(handle) {
            Ok(images) => Ok((handle, images)),
            Err(e) => {
                loader.destroy_swapchain(handle, None);
                Err(e)
            }
        }
    }
}

/// One color view per swapchain image. Nothing leaks on failure.
pub fn build_image_views<D: AttachmentFactory + Release>(
    dev: &D,
    images: &[vk::Image],
    format: vk::Format,
) -> VkResult<Vec<SwapchainImage>> {
    let mut out: Vec<SwapchainImage> = Vec::with_capacity(images.len());
    for &image in images {
        match dev.create_image_view(image, format, vk::ImageAspectFlags::COLOR) {
            Ok(view) => out.push(SwapchainImage {
                image,
                view,
                framebuffer: vk::Framebuffer::null(),
            }),
            Err(e) => {
                for made in out {
                    dev.release(PendingDestroy::ImageView(made.view));
                }
                return Err(e);
            }
        }
    }
    Ok(out)
}

/// One framebuffer per image: color view, plus the depth view when present.
pub fn build_framebuffers<D: AttachmentFactory + Release>(
    dev: &D,
    images: &mut [SwapchainImage],
    render_pass: vk::RenderPass,
    depth_view: Option<vk::ImageView>,
    extent: vk::Extent2D,
) -> VkResult<()> {
    for i in 0..images.len() {
        let mut attachments = vec![images[i].view];
        attachments.extend(depth_view);
        match dev.create_framebuffer(render_pass, &attachments, extent) {
            Ok(fb) => images[i].framebuffer = fb,
            Err(e) => {
                for img in &mut images[..i] {
                    dev.release(PendingDestroy::Framebuffer(img.framebuffer));
                    img.framebuffer = vk::Framebuffer::null();
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Attachment descriptions of the surface render pass. Both attachments
/// either clear or keep their previous contents depending on `clear_on_load`,
/// and both are stored.
pub fn surface_attachments(
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
    clear_on_load: bool,
) -> Vec<vk::AttachmentDescription> {
    let load = if clear_on_load {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    };
    let mut attachments = vec![vk::AttachmentDescription::default()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(load)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    if let Some(format) = depth_format {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(load)
                .stencil_store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }
    attachments
}

/// Color attachment plus an optional depth/stencil attachment.
///
/// # Safety
/// `device` must be a live logical device.
pub unsafe fn create_surface_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
    clear_on_load: bool,
) -> VkResult<vk::RenderPass> {
    let attachments = surface_attachments(color_format, depth_format, clear_on_load);

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref);
    if depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass));
    unsafe { device.create_render_pass(&info, None) }
}

/// Device-local depth/stencil image, its memory and view.
///
/// # Safety
/// `device` must be a live logical device created from the physical device
/// `memory` was queried from.
pub unsafe fn create_depth_stencil(
    device: &ash::Device,
    memory: &vk::PhysicalDeviceMemoryProperties,
    format: vk::Format,
    extent: vk::Extent2D,
) -> VkResult<DepthStencil> {
    let image_info = vk::ImageCreateInfo {
        image_type: vk::ImageType::TYPE_2D,
        format,
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };

    unsafe {
        let image = device.create_image(&image_info, None)?;
        let req = device.get_image_memory_requirements(image);
        let Some(type_index) = memory_type_from_properties(
            memory,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            warn!("no device-local memory type for the depth buffer");
            device.destroy_image(image, None);
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(type_index);
        let mem = match device.allocate_memory(&alloc, None) {
            Ok(m) => m,
            Err(e) => {
                device.destroy_image(image, None);
                return Err(e);
            }
        };
        let ops = DeviceOps {
            device,
            swapchain: None,
        };
        let bound = device.bind_image_memory(image, mem, 0).and_then(|()| {
            ops.create_image_view(
                image,
                format,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            )
        });
        match bound {
            Ok(view) => Ok(DepthStencil {
                format,
                image,
                memory: mem,
                view,
            }),
            Err(e) => {
                device.destroy_image(image, None);
                device.free_memory(mem, None);
                Err(e)
            }
        }
    }
}

/// Moves freshly created swapchain images into the present layout and the
/// depth buffer into its attachment layout. Recorded only; submitting `cmd`
/// is the caller's job.
///
/// # Safety
/// `cmd` must be recording and belong to `device`.
pub unsafe fn record_initial_layouts(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    targets: &SurfaceTargets,
) {
    unsafe {
        for img in &targets.images {
            transition_image_layout(
                device,
                cmd,
                img.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }
        if let Some(depth) = &targets.depth {
            transition_image_layout(
                device,
                cmd,
                depth.image,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            );
        }
    }
}

// STRICT TEARDOWN ORDER:
// framebuffers -> render pass -> depth (view, image, memory)
// -> swapchain image views -> swapchain -> present semaphores.
// The GPU must be idle before this runs.
pub fn teardown_presentation(targets: &mut SurfaceTargets, sync: &mut PresentSync, dev: &impl Release) {
    for img in &mut targets.images {
        dev.release(PendingDestroy::Framebuffer(img.framebuffer));
        img.framebuffer = vk::Framebuffer::null();
    }
    dev.release(PendingDestroy::RenderPass(targets.render_pass));
    targets.render_pass = vk::RenderPass::null();

    if let Some(depth) = targets.depth.take() {
        dev.release(PendingDestroy::ImageView(depth.view));
        dev.release(PendingDestroy::Image(depth.image));
        dev.release(PendingDestroy::Memory(depth.memory));
    }

    for img in targets.images.drain(..) {
        dev.release(PendingDestroy::ImageView(img.view));
    }
    dev.release(PendingDestroy::Swapchain(targets.swapchain));
    targets.swapchain = vk::SwapchainKHR::null();

    dev.release(PendingDestroy::Semaphore(sync.acquire));
    dev.release(PendingDestroy::Semaphore(sync.render_complete));
    *sync = PresentSync::default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDevice;
    use ash::vk::Handle;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn bgra_srgb_nonlinear_is_picked() {
        let f = choose_surface_format(&[sf(
            vk::Format::B8G8R8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )]);
        assert_eq!(f.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn undefined_format_falls_back_to_bgra() {
        let f = choose_surface_format(&[sf(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)]);
        assert_eq!(f.format, DEFAULT_SURFACE_FORMAT);
        assert_eq!(choose_surface_format(&[]).format, DEFAULT_SURFACE_FORMAT);
    }

    #[test]
    fn no_srgb_nonlinear_entry_takes_first() {
        let formats = [
            sf(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
            sf(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::A2B10G10R10_UNORM_PACK32);
    }

    #[test]
    fn preferred_format_found_later_in_list() {
        let formats = [
            sf(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            sf(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn mailbox_requested_and_available() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, ContextFlags::PRESENT_MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, ContextFlags::empty()),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, ContextFlags::PRESENT_IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn present_mode_scan_stops_at_first_requested() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        let flags = ContextFlags::PRESENT_MAILBOX | ContextFlags::PRESENT_IMMEDIATE;
        assert_eq!(choose_present_mode(&modes, flags), vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
    }

    #[test]
    fn undefined_extent_uses_window_size() {
        let mut c = caps(2, 3);
        assert_eq!(
            choose_extent(&c, RenderSize { width: 1, height: 1 }),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        c.current_extent.width = u32::MAX;
        c.current_extent.height = u32::MAX;
        assert_eq!(
            choose_extent(&c, RenderSize { width: 1280, height: 720 }),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
        assert_eq!(
            choose_extent(&c, RenderSize { width: 9000, height: 0 }),
            vk::Extent2D {
                width: 4096,
                height: 1
            }
        );
    }

    #[test]
    fn transform_and_alpha_fallbacks() {
        let mut c = caps(2, 3);
        assert_eq!(choose_pre_transform(&c), vk::SurfaceTransformFlagsKHR::IDENTITY);
        assert_eq!(choose_composite_alpha(&c), vk::CompositeAlphaFlagsKHR::OPAQUE);
        c.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        c.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        c.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(choose_pre_transform(&c), vk::SurfaceTransformFlagsKHR::ROTATE_90);
        assert_eq!(choose_composite_alpha(&c), vk::CompositeAlphaFlagsKHR::INHERIT);
    }

    #[test]
    fn depth_attachment_follows_clear_on_load() {
        let depth = Some(vk::Format::D24_UNORM_S8_UINT);
        let cleared = surface_attachments(vk::Format::B8G8R8A8_UNORM, depth, true);
        assert_eq!(cleared.len(), 2);
        assert_eq!(cleared[1].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(cleared[1].stencil_load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(cleared[1].store_op, vk::AttachmentStoreOp::STORE);

        let kept = surface_attachments(vk::Format::B8G8R8A8_UNORM, depth, false);
        for a in &kept {
            assert_eq!(a.load_op, vk::AttachmentLoadOp::LOAD);
            assert_eq!(a.store_op, vk::AttachmentStoreOp::STORE);
        }
        assert_eq!(kept[1].stencil_load_op, vk::AttachmentLoadOp::LOAD);

        assert_eq!(surface_attachments(vk::Format::B8G8R8A8_UNORM, None, true).len(), 1);
    }

    fn build(dev: &RecordingDevice, count: usize, extent: vk::Extent2D) -> SurfaceTargets {
        let images = dev.fake_images(count);
        let mut targets = SurfaceTargets {
            swapchain: vk::SwapchainKHR::from_raw(0xAAAA),
            render_pass: vk::RenderPass::from_raw(0xBBBB),
            images: build_image_views(dev, &images, vk::Format::B8G8R8A8_UNORM).unwrap(),
            ..Default::default()
        };
        targets.plan.extent = extent;
        build_framebuffers(dev, &mut targets.images, targets.render_pass, None, extent).unwrap();
        targets
    }

    #[test]
    fn resize_recreates_matching_framebuffers_without_leaks() {
        let dev = RecordingDevice::default();
        let small = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let mut targets = build(&dev, 3, small);
        assert_eq!(dev.live_views(), 3);
        assert_eq!(dev.live_framebuffers(), 3);

        let mut sync = PresentSync::default();
        teardown_presentation(&mut targets, &mut sync, &dev);
        assert_eq!(dev.live_views(), 0);
        assert_eq!(dev.live_framebuffers(), 0);

        let big = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let targets = build(&dev, 4, big);
        assert_eq!(targets.image_count(), 4);
        assert_eq!(dev.live_views(), 4);
        assert_eq!(dev.live_framebuffers(), 4);
        for img in &targets.images {
            assert_eq!(dev.framebuffer_extent(img.framebuffer), Some(big));
        }
    }

    #[test]
    fn teardown_follows_strict_order() {
        let dev = RecordingDevice::default();
        let extent = vk::Extent2D {
            width: 8,
            height: 8,
        };
        let mut targets = build(&dev, 2, extent);
        let depth = DepthStencil {
            format: vk::Format::D24_UNORM_S8_UINT,
            image: vk::Image::from_raw(0xD1),
            memory: vk::DeviceMemory::from_raw(0xD2),
            view: vk::ImageView::from_raw(0xD3),
        };
        targets.depth = Some(depth);
        let mut sync = PresentSync {
            acquire: vk::Semaphore::from_raw(0x51),
            render_complete: vk::Semaphore::from_raw(0x52),
        };
        let fbs: Vec<_> = targets.images.iter().map(|i| i.framebuffer).collect();
        let views: Vec<_> = targets.images.iter().map(|i| i.view).collect();

        teardown_presentation(&mut targets, &mut sync, &dev);

        let expected = vec![
            PendingDestroy::Framebuffer(fbs[0]),
            PendingDestroy::Framebuffer(fbs[1]),
            PendingDestroy::RenderPass(vk::RenderPass::from_raw(0xBBBB)),
            PendingDestroy::ImageView(depth.view),
            PendingDestroy::Image(depth.image),
            PendingDestroy::Memory(depth.memory),
            PendingDestroy::ImageView(views[0]),
            PendingDestroy::ImageView(views[1]),
            PendingDestroy::Swapchain(vk::SwapchainKHR::from_raw(0xAAAA)),
            PendingDestroy::Semaphore(vk::Semaphore::from_raw(0x51)),
            PendingDestroy::Semaphore(vk::Semaphore::from_raw(0x52)),
        ];
        assert_eq!(dev.released(), expected);

        // a second teardown has nothing left to release
        teardown_presentation(&mut targets, &mut sync, &dev);
        assert_eq!(dev.released().len(), expected.len());
    }

    #[test]
    fn failed_view_creation_releases_earlier_views() {
        let dev = RecordingDevice::default();
        let images = dev.fake_images(3);
        dev.fail_views_after(2);
        let err = build_image_views(&dev, &images, vk::Format::B8G8R8A8_UNORM).unwrap_err();
        assert_eq!(err, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert_eq!(dev.live_views(), 0);
    }
}
