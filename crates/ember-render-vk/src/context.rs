// SPDX-License-Identifier: CEPL-1.0
//! The rendering context: instance, device, surface, swapchain and the frame
//! ring, with every GPU object's lifetime tied to fence completion.
//!
//! Bring-up order is `new` -> `create_instance` -> `init_surface` ->
//! `choose_device` -> `create_device` -> `init_objects`; `create` runs all of
//! it. The surface may also be attached after the device, in which case the
//! device's graphics family must be able to present to it.

use std::ffi::{c_char, CStr};

use ash::khr::{surface, swapchain};
use ash::vk;
use ember_render::{RenderSize, SurfaceProvider};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bootstrap::{
    enumerate_device_extensions, enumerate_device_layers, enumerate_instance_extensions,
    enumerate_instance_layers, first_graphics_family, select_queue_families, DebugMessenger,
    PhysicalDeviceInfo, QueueSelection, VALIDATION_LAYER,
};
use crate::caps::{check_layers, name_ptrs, Capabilities, OptionalFeatures};
use crate::config::{ContextConfig, ContextFlags};
use crate::deletion::{DeletionHandle, DeletionQueue, DeviceOps, PendingDestroy};
use crate::error::{classify_result, ContextError, FrameError, PresentStatus};
use crate::frame::{assemble_submission, FrameRing, FrameSlot};
use crate::swapchain::{
    build_framebuffers, build_image_views, create_depth_stencil, create_surface_render_pass,
    create_swapchain, query_plan, record_initial_layouts, teardown_presentation, SurfaceTargets,
};
use crate::sync::{self, transition_image_layout, PresentSync};

/// Frames only start on a live swapchain of a context whose last
/// initialization step succeeded.
fn ensure_presentable(init_error: Option<&str>, swapchain: vk::SwapchainKHR) -> Result<(), FrameError> {
    if init_error.is_some() || swapchain == vk::SwapchainKHR::null() {
        return Err(FrameError::NotInitialized);
    }
    Ok(())
}

fn warn_on_err(what: &str, res: ash::prelude::VkResult<()>) {
    if let Err(e) = res {
        warn!("{what}: {e}");
    }
}

unsafe fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> ash::prelude::VkResult<()> {
    let info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.begin_command_buffer(cmd, &info) }
}

pub struct VulkanContext {
    config: ContextConfig,
    init_error: Option<String>,

    entry: Option<ash::Entry>,
    instance: Option<ash::Instance>,
    debug: Option<DebugMessenger>,
    caps: Capabilities,
    physical_devices: Vec<vk::PhysicalDevice>,
    physical: Option<PhysicalDeviceInfo>,

    surface_loader: Option<surface::Instance>,
    surface: vk::SurfaceKHR,
    window_size: RenderSize,

    device: Option<ash::Device>,
    swapchain_loader: Option<swapchain::Device>,
    queues: Option<QueueSelection>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,

    slots: Vec<FrameSlot>,
    ring: FrameRing,
    deletions: DeletionQueue,
    queued: Vec<vk::CommandBuffer>,

    targets: SurfaceTargets,
    present_sync: PresentSync,
}

impl VulkanContext {
    /// Loads the Vulkan library and enumerates instance layers/extensions.
    /// Never fails; check `init_error` before going further.
    pub fn new(config: ContextConfig) -> Self {
        let slots = config.inflight();
        let mut ctx = Self {
            config,
            init_error: None,
            entry: None,
            instance: None,
            debug: None,
            caps: Capabilities::default(),
            physical_devices: Vec::new(),
            physical: None,
            surface_loader: None,
            surface: vk::SurfaceKHR::null(),
            window_size: RenderSize {
                width: 0,
                height: 0,
            },
            device: None,
            swapchain_loader: None,
            queues: None,
            graphics_queue: vk::Queue::null(),
            present_queue: vk::Queue::null(),
            slots: Vec::new(),
            ring: FrameRing::new(slots),
            deletions: DeletionQueue::new(slots),
            queued: Vec::new(),
            targets: SurfaceTargets::default(),
            present_sync: PresentSync::default(),
        };

        // SAFETY: the library is only used through `ctx`, which outlives no
        // object created from it.
        let entry = match unsafe { ash::Entry::load() } {
            Ok(e) => e,
            Err(e) => {
                let err = ContextError::Loader(e.to_string());
                error!("{err}");
                ctx.init_error = Some(err.to_string());
                return ctx;
            }
        };
        unsafe {
            match enumerate_instance_layers(&entry) {
                Ok(layers) => ctx.caps.instance_layers = layers,
                Err(e) => warn!("instance layer enumeration failed: {e}"),
            }
            match enumerate_instance_extensions(&entry) {
                Ok(exts) => ctx.caps.instance_extensions = exts,
                Err(e) => warn!("instance extension enumeration failed: {e}"),
            }
        }
        debug!(
            "{} instance layers, {} instance extensions",
            ctx.caps.instance_layers.len(),
            ctx.caps.instance_extensions.len()
        );
        ctx.entry = Some(entry);
        ctx
    }

    /// Runs the whole bring-up against `surface` with the first physical device.
    pub fn create(config: ContextConfig, surface: &dyn SurfaceProvider) -> Result<Self, ContextError> {
        let mut ctx = Self::new(config);
        if let Some(err) = ctx.init_error() {
            return Err(ContextError::Earlier(err.to_owned()));
        }
        let (display, _) = surface
            .raw_handles()
            .map_err(|e| ContextError::Surface(format!("{e:#}")))?;
        ctx.create_instance(display)?;
        ctx.init_debug_messenger();
        ctx.init_surface(surface)?;
        ctx.choose_device(0)?;
        ctx.create_device()?;
        ctx.init_objects()?;
        Ok(ctx)
    }

    fn record<T>(&mut self, res: Result<T, ContextError>) -> Result<T, ContextError> {
        if let Err(e) = &res {
            error!("{e}");
            self.init_error = Some(e.to_string());
        }
        res
    }

    /// Human-readable reason the last initialization step failed.
    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    // --- instance ----------------------------------------------------------

    pub fn create_instance(&mut self, display: RawDisplayHandle) -> Result<(), ContextError> {
        let res = self.try_create_instance(display);
        self.record(res)
    }

    fn try_create_instance(&mut self, display: RawDisplayHandle) -> Result<(), ContextError> {
        let Some(entry) = self.entry.as_ref() else {
            return Err(ContextError::NotInitialized("vulkan loader"));
        };

        let required = ash_window::enumerate_required_extensions(display)
            .map_err(|e| ContextError::Surface(e.to_string()))?;
        for &ext in required {
            // SAFETY: ash-window hands out static NUL-terminated names.
            let name = unsafe { CStr::from_ptr(ext) };
            if !self.caps.enable_instance_extension(name) {
                warn!("surface extension {} not available", name.to_string_lossy());
            }
        }
        if self.config.validate() {
            self.caps.request_layers(&[VALIDATION_LAYER]);
            if !self.caps.enable_instance_extension(ash::ext::debug_utils::NAME) {
                warn!("VK_EXT_debug_utils unavailable; validation output stays in the loader");
            }
        }

        let app_name = std::ffi::CString::new(self.config.app_name.as_str())
            .unwrap_or_else(|_| c"ember".to_owned());
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(self.config.app_version)
            .engine_name(&app_name)
            .engine_version(2)
            .api_version(vk::API_VERSION_1_0);

        let exts = name_ptrs(&self.caps.enabled_instance_extensions);
        let mut layers = name_ptrs(&self.caps.enabled_instance_layers);
        let create = |layers: &[*const c_char]| {
            let info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(layers)
                .enabled_extension_names(&exts);
            unsafe { entry.create_instance(&info, None) }
        };

        let instance = match create(&layers) {
            Ok(i) => i,
            Err(vk::Result::ERROR_LAYER_NOT_PRESENT) => {
                warn!("validation on but layers not available - dropping layers");
                layers.clear();
                let res = create(&layers);
                self.caps.clear_layers();
                res.map_err(ContextError::Instance)?
            }
            Err(e) => return Err(ContextError::Instance(e)),
        };
        info!(
            "instance created: {} layers, {} extensions",
            self.caps.enabled_instance_layers.len(),
            self.caps.enabled_instance_extensions.len()
        );

        let surface_loader = surface::Instance::new(entry, &instance);
        let devices = unsafe { instance.enumerate_physical_devices() };
        self.instance = Some(instance);
        self.surface_loader = Some(surface_loader);

        self.physical_devices = devices.map_err(ContextError::Enumerate)?;
        if self.physical_devices.is_empty() {
            return Err(ContextError::NoPhysicalDevice);
        }
        Ok(())
    }

    /// Routes validation messages into the log. Skipped with a warning when
    /// validation is off or the extension is missing.
    pub fn init_debug_messenger(&mut self) {
        if !self.config.validate() {
            warn!("not registering debug messenger - validation not enabled");
            return;
        }
        if !self
            .caps
            .enabled_instance_extensions
            .iter()
            .any(|e| e.as_c_str() == ash::ext::debug_utils::NAME)
        {
            warn!("not registering debug messenger - VK_EXT_debug_utils not enabled");
            return;
        }
        let (Some(entry), Some(instance)) = (self.entry.as_ref(), self.instance.as_ref()) else {
            return;
        };
        match unsafe { DebugMessenger::new(entry, instance) } {
            Ok(m) => {
                info!("debug messenger registered");
                self.debug = Some(m);
            }
            Err(e) => warn!("debug messenger registration failed: {e}"),
        }
    }

    pub fn destroy_debug_messenger(&mut self) {
        if let Some(m) = self.debug.take() {
            unsafe { m.destroy() };
        }
    }

    pub fn physical_device_count(&self) -> usize {
        self.physical_devices.len()
    }

    // --- device ------------------------------------------------------------

    /// Records queue families, memory types and features of device `index`,
    /// picks the depth/stencil format and the optional features to enable.
    pub fn choose_device(&mut self, index: usize) -> Result<(), ContextError> {
        let res = self.try_choose_device(index);
        self.record(res)
    }

    fn try_choose_device(&mut self, index: usize) -> Result<(), ContextError> {
        let Some(instance) = self.instance.as_ref() else {
            return Err(ContextError::NotInitialized("instance"));
        };
        let count = self.physical_devices.len();
        let handle = *self
            .physical_devices
            .get(index)
            .ok_or(ContextError::BadDeviceIndex { index, count })?;

        unsafe {
            match enumerate_device_layers(instance, handle) {
                Ok(layers) => self.caps.device_layers = layers,
                Err(e) => warn!("device layer enumeration failed: {e}"),
            }
            self.caps.device_extensions = enumerate_device_extensions(instance, handle)?;
        }
        if !check_layers(&self.caps.device_layers, &self.caps.enabled_device_layers) {
            warn!("device layers incomplete; continuing");
        }

        let info = unsafe { PhysicalDeviceInfo::query(instance, handle) };
        info!(
            "physical device {index}: {} (depth format {:?})",
            info.name(),
            info.depth_format
        );
        self.caps.enable_features(info.features, OptionalFeatures::CURATED);
        if !self.caps.enable_device_extension(swapchain::NAME) {
            return Err(ContextError::Device(vk::Result::ERROR_EXTENSION_NOT_PRESENT));
        }
        self.physical = Some(info);
        Ok(())
    }

    /// Enables a device extension if the chosen device lists it. Must run
    /// between `choose_device` and `create_device`.
    pub fn enable_device_extension(&mut self, name: &CStr) -> bool {
        self.caps.enable_device_extension(name)
    }

    pub fn create_device(&mut self) -> Result<(), ContextError> {
        if let Some(err) = &self.init_error {
            let err = ContextError::Earlier(err.clone());
            error!("{err}");
            return Err(err);
        }
        let res = self.try_create_device();
        self.record(res)
    }

    fn try_create_device(&mut self) -> Result<(), ContextError> {
        let (Some(instance), Some(physical)) = (self.instance.as_ref(), self.physical.as_ref())
        else {
            return Err(ContextError::NotInitialized("physical device"));
        };

        let queues = match (self.surface_loader.as_ref(), self.surface) {
            (Some(loader), surface) if surface != vk::SurfaceKHR::null() => {
                select_queue_families(&physical.queue_families, |i| unsafe {
                    loader
                        .get_physical_device_surface_support(physical.handle, i, surface)
                        .unwrap_or(false)
                })?
            }
            _ => {
                let graphics = first_graphics_family(&physical.queue_families)
                    .ok_or(ContextError::NoGraphicsQueue)?;
                QueueSelection {
                    graphics,
                    present: graphics,
                }
            }
        };

        let priorities = [1.0f32];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queues.graphics)
            .queue_priorities(&priorities)];
        if !queues.is_shared() {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(queues.present)
                    .queue_priorities(&priorities),
            );
        }

        let features = self.caps.features_enabled.to_vk();
        let layers = name_ptrs(&self.caps.enabled_device_layers);
        let exts = name_ptrs(&self.caps.enabled_device_extensions);
        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&exts)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical.handle, &info, None) }
            .map_err(ContextError::Device)?;
        unsafe {
            self.graphics_queue = device.get_device_queue(queues.graphics, 0);
            self.present_queue = device.get_device_queue(queues.present, 0);
        }
        info!(
            "device created: graphics family {}, present family {}, features {:?}",
            queues.graphics, queues.present, self.caps.features_enabled
        );
        self.swapchain_loader = Some(swapchain::Device::new(instance, &device));
        self.device = Some(device);
        self.queues = Some(queues);
        Ok(())
    }

    // --- surface -----------------------------------------------------------

    pub fn init_surface(&mut self, provider: &dyn SurfaceProvider) -> Result<(), ContextError> {
        let res = self.try_init_surface(provider);
        self.record(res)
    }

    fn try_init_surface(&mut self, provider: &dyn SurfaceProvider) -> Result<(), ContextError> {
        let (Some(entry), Some(instance)) = (self.entry.as_ref(), self.instance.as_ref()) else {
            return Err(ContextError::NotInitialized("instance"));
        };
        let (display, window) = provider
            .raw_handles()
            .map_err(|e| ContextError::Surface(format!("{e:#}")))?;
        let surface = unsafe { ash_window::create_surface(entry, instance, display, window, None) }
            .map_err(|e| ContextError::Surface(e.to_string()))?;
        self.surface = surface;
        self.window_size = provider.size();
        debug!(
            "surface created ({}x{})",
            self.window_size.width, self.window_size.height
        );
        self.check_present_support()
    }

    /// A device created before the surface must still be able to present.
    fn check_present_support(&self) -> Result<(), ContextError> {
        let (Some(loader), Some(physical), Some(queues)) = (
            self.surface_loader.as_ref(),
            self.physical.as_ref(),
            self.queues,
        ) else {
            return Ok(());
        };
        let ok = unsafe {
            loader
                .get_physical_device_surface_support(physical.handle, queues.present, self.surface)
                .unwrap_or(false)
        };
        if ok {
            Ok(())
        } else {
            Err(ContextError::NoPresentQueue)
        }
    }

    /// Replaces the surface, for instance after the native window was
    /// recreated. Presentation objects are rebuilt when they existed.
    pub fn reinit_surface(&mut self, provider: &dyn SurfaceProvider) -> Result<(), ContextError> {
        let had_targets = self.targets.swapchain != vk::SwapchainKHR::null();
        if had_targets {
            self.quiesce();
            self.teardown_presentation();
        }
        self.destroy_surface();
        self.init_surface(provider)?;
        if had_targets {
            let res = self.build_presentation();
            self.record(res)?;
            self.init_error = None;
        }
        Ok(())
    }

    fn destroy_surface(&mut self) {
        if let Some(loader) = self.surface_loader.as_ref() {
            if self.surface != vk::SurfaceKHR::null() {
                unsafe { loader.destroy_surface(self.surface, None) };
            }
        }
        self.surface = vk::SurfaceKHR::null();
    }

    // --- objects -----------------------------------------------------------

    /// Allocates the frame slots and builds swapchain, depth buffer, render
    /// pass and framebuffers. The initial layout transitions go onto the
    /// current slot's init buffer and execute with the first frame.
    pub fn init_objects(&mut self) -> Result<(), ContextError> {
        if let Some(err) = &self.init_error {
            return Err(ContextError::Earlier(err.clone()));
        }
        let res = self.try_init_objects();
        self.record(res)
    }

    fn try_init_objects(&mut self) -> Result<(), ContextError> {
        let (Some(device), Some(queues)) = (self.device.as_ref(), self.queues) else {
            return Err(ContextError::NotInitialized("device"));
        };
        if self.surface == vk::SurfaceKHR::null() {
            return Err(ContextError::NotInitialized("surface"));
        }
        self.check_present_support()?;

        // Ring and deletion queue were sized in `new`; handles given out
        // since then must keep feeding the same queue.
        let n = self.ring.len();
        while self.slots.len() < n {
            let slot = unsafe { FrameSlot::new(device, queues.graphics)? };
            self.slots.push(slot);
        }
        info!("{n} frames in flight");

        self.build_presentation()
    }

    fn build_presentation(&mut self) -> Result<(), ContextError> {
        {
            let (Some(device), Some(sc_loader), Some(surface_loader), Some(physical), Some(queues)) = (
                self.device.as_ref(),
                self.swapchain_loader.as_ref(),
                self.surface_loader.as_ref(),
                self.physical.as_ref(),
                self.queues,
            ) else {
                return Err(ContextError::NotInitialized("device"));
            };

            self.present_sync = unsafe { PresentSync::new(device)? };
            let plan = unsafe {
                query_plan(
                    surface_loader,
                    physical.handle,
                    self.surface,
                    self.window_size,
                    self.config.flags,
                )
            }
            .map_err(ContextError::Swapchain)?;
            let (handle, images) = unsafe {
                create_swapchain(sc_loader, self.surface, &plan, [queues.graphics, queues.present])
            }
            .map_err(ContextError::Swapchain)?;
            self.targets.swapchain = handle;
            self.targets.plan = plan;

            let ops = DeviceOps {
                device,
                swapchain: Some(sc_loader),
            };
            self.targets.images = build_image_views(&ops, &images, plan.format.format)?;

            let depth_format = if !self.config.depth {
                None
            } else if physical.depth_format == vk::Format::UNDEFINED {
                warn!("no usable depth/stencil format; rendering without depth");
                None
            } else {
                Some(physical.depth_format)
            };
            if let Some(format) = depth_format {
                self.targets.depth =
                    Some(unsafe { create_depth_stencil(device, &physical.memory, format, plan.extent)? });
            }
            self.targets.render_pass = unsafe {
                create_surface_render_pass(
                    device,
                    plan.format.format,
                    depth_format,
                    self.config.clear_on_load,
                )?
            };
            build_framebuffers(
                &ops,
                &mut self.targets.images,
                self.targets.render_pass,
                self.targets.depth.map(|d| d.view),
                plan.extent,
            )?;
        }

        let cmd = self
            .get_init_command_buffer()
            .map_err(|_| ContextError::NotInitialized("frame slots"))?;
        if let Some(device) = self.device.as_ref() {
            unsafe { record_initial_layouts(device, cmd, &self.targets) };
        }
        Ok(())
    }

    fn teardown_presentation(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let ops = DeviceOps {
            device,
            swapchain: self.swapchain_loader.as_ref(),
        };
        teardown_presentation(&mut self.targets, &mut self.present_sync, &ops);
    }

    /// Waits for the queue, closes any half-recorded frame and throws away
    /// init commands that may reference the old swapchain images.
    fn quiesce(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        unsafe {
            if self.ring.is_recording() {
                let slot = self.slots[self.ring.current()];
                // Signals the fence that begin_frame reset.
                warn_on_err("end open frame", device.end_command_buffer(slot.cmd_main));
                warn_on_err(
                    "signal open frame fence",
                    device.queue_submit(self.graphics_queue, &[], slot.fence),
                );
            }
            warn_on_err("graphics queue idle", device.queue_wait_idle(self.graphics_queue));
            if !self.present_queue_is_graphics() {
                warn_on_err("present queue idle", device.queue_wait_idle(self.present_queue));
            }
            for slot in &mut self.slots {
                if slot.has_init_commands {
                    warn!("discarding pending init commands");
                    warn_on_err("end init buffer", device.end_command_buffer(slot.cmd_init));
                    warn_on_err(
                        "reset init buffer",
                        device.reset_command_buffer(slot.cmd_init, vk::CommandBufferResetFlags::empty()),
                    );
                    slot.has_init_commands = false;
                }
            }
        }
        self.ring.abandon();
        self.ring.retire_all();
        self.queued.clear();
    }

    fn present_queue_is_graphics(&self) -> bool {
        self.queues.map_or(true, |q| q.is_shared())
    }

    /// Tears the presentation objects down and builds them again for `size`.
    /// On failure no frame can begin until a later call succeeds.
    pub fn recreate_swapchain(&mut self, size: RenderSize) -> Result<(), ContextError> {
        self.window_size = size;
        self.quiesce();
        self.teardown_presentation();
        let res = self.build_presentation();
        self.record(res)?;
        self.init_error = None;
        Ok(())
    }

    // --- frames ------------------------------------------------------------

    /// Acquires the next image, waits for this slot's previous submission,
    /// releases what it was keeping alive and starts the main command buffer
    /// with the image in the color-attachment layout.
    ///
    /// Fails with `NotInitialized` while the swapchain is missing or the last
    /// (re)initialization failed.
    pub fn begin_frame(&mut self) -> Result<vk::CommandBuffer, FrameError> {
        ensure_presentable(self.init_error.as_deref(), self.targets.swapchain)?;
        let Some(sc) = self.swapchain_loader.as_ref() else {
            return Err(FrameError::NotInitialized);
        };
        let slot_index = self.ring.begin_acquire()?;

        let acquired = unsafe {
            sc.acquire_next_image(
                self.targets.swapchain,
                u64::MAX,
                self.present_sync.acquire,
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    trace!("acquired image {index} from a suboptimal swapchain");
                }
                index
            }
            Err(e) => {
                self.ring.acquire_failed();
                return Err(classify_result(e));
            }
        };
        self.ring.acquired(image_index);

        match self.start_recording(slot_index, image_index) {
            Ok(cmd) => Ok(cmd),
            Err(e) => {
                warn!("frame on slot {slot_index} abandoned: {e}");
                self.ring.abandon();
                Err(e)
            }
        }
    }

    /// The fence is reset last so a failure before it leaves the slot's fence
    /// signalled for the next attempt.
    fn start_recording(&mut self, slot_index: usize, image_index: u32) -> Result<vk::CommandBuffer, FrameError> {
        let (Some(device), Some(sc)) = (self.device.as_ref(), self.swapchain_loader.as_ref()) else {
            return Err(FrameError::NotInitialized);
        };
        let slot = self.slots[slot_index];
        unsafe { device.wait_for_fences(std::slice::from_ref(&slot.fence), true, u64::MAX)? };
        let retired = self.ring.retire_current();

        let ops = DeviceOps {
            device,
            swapchain: Some(sc),
        };
        let released = self.deletions.drain(slot_index, retired, &ops);
        if released > 0 {
            trace!("released {released} deferred objects (slot {slot_index})");
        }

        unsafe {
            // An open init buffer shares the pool; only the main buffer is reset then.
            if slot.has_init_commands {
                device.reset_command_buffer(slot.cmd_main, vk::CommandBufferResetFlags::empty())?;
            } else {
                device.reset_command_pool(slot.cmd_pool, vk::CommandPoolResetFlags::empty())?;
            }
            begin_one_time(device, slot.cmd_main)?;
            device.reset_fences(std::slice::from_ref(&slot.fence))?;
            transition_image_layout(
                device,
                slot.cmd_main,
                self.targets.images[image_index as usize].image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );
        }
        Ok(slot.cmd_main)
    }

    /// The current slot's init buffer, begun on first use. Its commands run
    /// before everything else in the slot's next submission.
    ///
    /// Called between frames this blocks on the slot's fence until its last
    /// submission has finished, since the buffer shares that slot's pool.
    pub fn get_init_command_buffer(&mut self) -> Result<vk::CommandBuffer, FrameError> {
        let Some(device) = self.device.as_ref() else {
            return Err(FrameError::NotInitialized);
        };
        let current = self.ring.current();
        let Some(slot) = self.slots.get(current).copied() else {
            return Err(FrameError::NotInitialized);
        };
        if !slot.has_init_commands {
            unsafe {
                if !self.ring.is_recording() {
                    // Between frames the slot's last submission may still be running.
                    device.wait_for_fences(std::slice::from_ref(&slot.fence), true, u64::MAX)?;
                    device.reset_command_pool(slot.cmd_pool, vk::CommandPoolResetFlags::empty())?;
                }
                begin_one_time(device, slot.cmd_init)?;
            }
            self.slots[current].has_init_commands = true;
        }
        Ok(slot.cmd_init)
    }

    /// Runs `cmd` after the init buffer and before the main buffer of the
    /// frame that ends next. `cmd` must already be ended.
    pub fn queue_before_surface_render(&mut self, cmd: vk::CommandBuffer) {
        self.queued.push(cmd);
    }

    /// Begins the surface render pass on the current image. The second clear
    /// value is only used when there is a depth attachment.
    pub fn begin_surface_render_pass(
        &mut self,
        clear: [vk::ClearValue; 2],
    ) -> Result<vk::CommandBuffer, FrameError> {
        ensure_presentable(self.init_error.as_deref(), self.targets.swapchain)?;
        let Some(device) = self.device.as_ref() else {
            return Err(FrameError::NotInitialized);
        };
        let image_index = self.ring.image_index()?;
        let cmd = self.slots[self.ring.current()].cmd_main;
        let clear_count = if self.targets.depth.is_some() { 2 } else { 1 };
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(self.targets.render_pass)
            .framebuffer(self.targets.images[image_index as usize].framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.targets.plan.extent,
            })
            .clear_values(&clear[..clear_count]);
        unsafe { device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE) };
        Ok(cmd)
    }

    pub fn end_surface_render_pass(&mut self) -> Result<(), FrameError> {
        let Some(device) = self.device.as_ref() else {
            return Err(FrameError::NotInitialized);
        };
        self.ring.image_index()?;
        let cmd = self.slots[self.ring.current()].cmd_main;
        unsafe { device.cmd_end_render_pass(cmd) };
        Ok(())
    }

    /// Returns the image to the present layout, submits
    /// `[init?, queued.., main]` as one batch and presents. Deletions requested
    /// so far are handed to this slot and released once its fence signals.
    pub fn end_frame(&mut self) -> Result<PresentStatus, FrameError> {
        ensure_presentable(self.init_error.as_deref(), self.targets.swapchain)?;
        let (Some(device), Some(sc)) = (self.device.as_ref(), self.swapchain_loader.as_ref()) else {
            return Err(FrameError::NotInitialized);
        };
        let image_index = self.ring.image_index()?;
        let current = self.ring.current();
        let slot = self.slots[current];

        unsafe {
            transition_image_layout(
                device,
                slot.cmd_main,
                self.targets.images[image_index as usize].image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
            device.end_command_buffer(slot.cmd_main)?;
            if slot.has_init_commands {
                device.end_command_buffer(slot.cmd_init)?;
            }
        }
        let init = slot.has_init_commands.then_some(slot.cmd_init);
        self.slots[current].has_init_commands = false;
        let buffers = assemble_submission(init, &self.queued, slot.cmd_main);
        self.queued.clear();

        let wait = [self.present_sync.acquire];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let signal = [self.present_sync.render_complete];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&buffers)
            .signal_semaphores(&signal);
        unsafe { device.queue_submit(self.graphics_queue, std::slice::from_ref(&submit), slot.fence)? };

        let (slot_index, generation) = self.ring.submit()?;
        self.deletions.promote(slot_index, generation);

        let swapchains = [self.targets.swapchain];
        let indices = [image_index];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { sc.queue_present(self.present_queue, &present) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(e) => Err(classify_result(e)),
        }
    }

    /// Blocks until the graphics queue is idle. Shutdown and resize only.
    pub fn wait_until_queue_idle(&self) {
        if let Some(device) = self.device.as_ref() {
            warn_on_err("graphics queue idle", unsafe { device.queue_wait_idle(self.graphics_queue) });
        }
    }

    // --- deferred deletion --------------------------------------------------

    /// Schedules `object` for destruction once no in-flight frame can use it.
    pub fn delete(&self, object: PendingDestroy) {
        self.deletions.enqueue(object);
    }

    /// Thread-safe handle for enqueueing deletions from elsewhere.
    pub fn deletion_handle(&self) -> DeletionHandle {
        self.deletions.handle()
    }

    // --- object helpers -----------------------------------------------------

    fn live_device(&self) -> Result<&ash::Device, ContextError> {
        self.device.as_ref().ok_or(ContextError::NotInitialized("device"))
    }

    pub fn create_fence(&self, presignalled: bool) -> Result<vk::Fence, ContextError> {
        let device = self.live_device()?;
        Ok(unsafe { sync::create_fence(device, presignalled)? })
    }

    pub fn wait_and_reset_fence(&self, fence: vk::Fence) -> Result<(), ContextError> {
        let device = self.live_device()?;
        Ok(unsafe { sync::wait_and_reset_fence(device, fence)? })
    }

    pub fn create_pipeline_cache(&self) -> Result<vk::PipelineCache, ContextError> {
        let device = self.live_device()?;
        let info = vk::PipelineCacheCreateInfo::default();
        Ok(unsafe { device.create_pipeline_cache(&info, None)? })
    }

    pub fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule, ContextError> {
        let device = self.live_device()?;
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        Ok(unsafe { device.create_shader_module(&info, None)? })
    }

    // --- accessors ----------------------------------------------------------

    pub fn instance(&self) -> Option<&ash::Instance> {
        self.instance.as_ref()
    }

    pub fn device(&self) -> Option<&ash::Device> {
        self.device.as_ref()
    }

    pub fn physical_device(&self) -> Option<&PhysicalDeviceInfo> {
        self.physical.as_ref()
    }

    pub fn physical_device_properties(&self) -> Option<&vk::PhysicalDeviceProperties> {
        self.physical.as_ref().map(|p| &p.properties)
    }

    pub fn memory_properties(&self) -> Option<&vk::PhysicalDeviceMemoryProperties> {
        self.physical.as_ref().map(|p| &p.memory)
    }

    pub fn queue_family(&self) -> Option<u32> {
        self.queues.map(|q| q.graphics)
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn flags(&self) -> ContextFlags {
        self.config.flags
    }

    /// Takes effect at the next swapchain recreation.
    pub fn set_flags(&mut self, flags: ContextFlags) {
        self.config.flags = flags;
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.targets.plan.format.format
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.targets.plan.extent
    }

    pub fn swapchain_image_count(&self) -> usize {
        self.targets.image_count()
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.targets.plan.present_mode
    }

    pub fn current_image_index(&self) -> Option<u32> {
        self.ring.image_index().ok()
    }

    pub fn surface_render_pass(&self) -> vk::RenderPass {
        self.targets.render_pass
    }

    pub fn current_framebuffer(&self) -> Option<vk::Framebuffer> {
        let index = self.current_image_index()?;
        self.targets.images.get(index as usize).map(|i| i.framebuffer)
    }

    pub fn inflight_frames(&self) -> usize {
        self.ring.len()
    }

    pub fn current_frame(&self) -> usize {
        self.ring.current()
    }
}

// STRICT TEARDOWN ORDER:
// - wait for the device
// - frame slots: command buffers before their pool, then fences
// - presentation objects (see swapchain::teardown_presentation)
// - every pending deletion
// - surface, device, debug messenger, instance last
impl Drop for VulkanContext {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            unsafe {
                warn_on_err("device idle", device.device_wait_idle());
                for slot in &mut self.slots {
                    slot.destroy(&device);
                }
            }
            let ops = DeviceOps {
                device: &device,
                swapchain: self.swapchain_loader.as_ref(),
            };
            teardown_presentation(&mut self.targets, &mut self.present_sync, &ops);
            let released = self.deletions.drain_all(&ops);
            debug!("teardown released {released} deferred objects");
            self.destroy_surface();
            unsafe { device.destroy_device(None) };
        } else {
            self.destroy_surface();
        }
        self.destroy_debug_messenger();
        if let Some(instance) = self.instance.take() {
            unsafe { instance.destroy_instance(None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDevice;
    use ash::vk::Handle;

    #[test]
    fn frames_need_a_live_swapchain_and_a_clean_init() {
        let live = vk::SwapchainKHR::from_raw(0x42);
        assert_eq!(ensure_presentable(None, live), Ok(()));
        assert_eq!(
            ensure_presentable(None, vk::SwapchainKHR::null()),
            Err(FrameError::NotInitialized)
        );
        assert_eq!(
            ensure_presentable(Some("Failed to create swapchain"), live),
            Err(FrameError::NotInitialized)
        );
    }

    #[test]
    fn no_frame_starts_after_a_failed_rebuild() {
        let mut ctx = VulkanContext::new(ContextConfig::default());
        ctx.targets.swapchain = vk::SwapchainKHR::from_raw(0x42);
        ctx.init_error = Some("Failed to create swapchain: ERROR_SURFACE_LOST_KHR".into());

        assert_eq!(ctx.begin_frame(), Err(FrameError::NotInitialized));
        assert_eq!(ctx.end_frame(), Err(FrameError::NotInitialized));
        assert!(ctx
            .begin_surface_render_pass([vk::ClearValue::default(); 2])
            .is_err());
        assert_eq!(ctx.ring.state(0), crate::frame::SlotState::Idle);
    }

    #[test]
    fn deletions_queued_before_init_are_still_released() {
        let mut ctx = VulkanContext::new(ContextConfig::default());
        let handle = ctx.deletion_handle();
        let image = PendingDestroy::Image(vk::Image::from_raw(0x77));
        let buffer = PendingDestroy::Buffer(vk::Buffer::from_raw(0x78));
        handle.enqueue(image);
        ctx.delete(buffer);

        // No device here, so this fails; the queue must be left as it was.
        assert!(ctx.init_objects().is_err());
        assert_eq!(ctx.inflight_frames(), ctx.config().inflight());
        assert_eq!(handle.len(), 2);

        let dev = RecordingDevice::default();
        assert_eq!(ctx.deletions.drain_all(&dev), 2);
        let released = dev.released();
        assert!(released.contains(&image));
        assert!(released.contains(&buffer));
        assert!(handle.is_empty());
    }
}
