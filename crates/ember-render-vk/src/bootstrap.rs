// SPDX-License-Identifier: CEPL-1.0
//! Instance/device discovery helpers: layer enumeration, physical device
//! records, queue family selection and the validation messenger.

use std::ffi::{c_void, CStr};

use ash::ext::debug_utils;
use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, error, info, warn};

use crate::caps::{enumerate_stable, extension_names, raw_name, LayerProperties, OptionalFeatures};
use crate::error::ContextError;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Tried in this order; the first one usable as an optimal-tiling
/// depth/stencil attachment wins.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
];

/// First memory type allowed by `type_bits` whose flags include `required`.
pub fn memory_type_from_properties(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

pub fn pick_depth_format(
    mut format_props: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&f| {
        format_props(f)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSelection {
    pub graphics: u32,
    pub present: u32,
}

impl QueueSelection {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Prefers a family that does both graphics and present; otherwise the first
/// graphics family plus the first present-capable one.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Result<QueueSelection, ContextError> {
    let present: Vec<bool> = (0..families.len() as u32).map(&mut supports_present).collect();
    let mut graphics = None;
    for (i, fam) in families.iter().enumerate() {
        if !fam.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        if present[i] {
            let i = i as u32;
            return Ok(QueueSelection {
                graphics: i,
                present: i,
            });
        }
        graphics.get_or_insert(i as u32);
    }
    let graphics = graphics.ok_or(ContextError::NoGraphicsQueue)?;
    let present = present
        .iter()
        .position(|&p| p)
        .ok_or(ContextError::NoPresentQueue)? as u32;
    Ok(QueueSelection { graphics, present })
}

/// First graphics-capable family, used when no surface is known yet.
pub fn first_graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

/// What the context learns about the chosen GPU. Never changes afterwards.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub features: OptionalFeatures,
    /// `UNDEFINED` when no candidate works; depth is then disabled.
    pub depth_format: vk::Format,
}

impl PhysicalDeviceInfo {
    /// # Safety
    /// `handle` must have been enumerated from `instance`.
    pub unsafe fn query(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Self {
        unsafe {
            let properties = instance.get_physical_device_properties(handle);
            let memory = instance.get_physical_device_memory_properties(handle);
            let queue_families = instance.get_physical_device_queue_family_properties(handle);
            let features = OptionalFeatures::from_vk(&instance.get_physical_device_features(handle));
            let depth_format = pick_depth_format(|f| {
                instance.get_physical_device_format_properties(handle, f)
            })
            .unwrap_or(vk::Format::UNDEFINED);
            Self {
                handle,
                properties,
                memory,
                queue_families,
                features,
                depth_format,
            }
        }
    }

    pub fn name(&self) -> String {
        raw_name(&self.properties.device_name).to_string_lossy().into_owned()
    }
}

/// Instance layers with the extensions each one exposes.
///
/// # Safety
/// `entry` must hold a loaded Vulkan library.
pub unsafe fn enumerate_instance_layers(entry: &ash::Entry) -> VkResult<Vec<LayerProperties>> {
    let fp = entry.fp_v1_0();
    let layers = enumerate_stable(|count, data| unsafe {
        (fp.enumerate_instance_layer_properties)(count, data)
    })?;
    layers
        .iter()
        .map(|l| {
            let name = raw_name(&l.layer_name);
            let exts = enumerate_stable(|count, data| unsafe {
                (fp.enumerate_instance_extension_properties)(name.as_ptr(), count, data)
            })?;
            Ok(LayerProperties {
                name: name.to_owned(),
                description: raw_name(&l.description).to_string_lossy().into_owned(),
                extensions: extension_names(&exts),
            })
        })
        .collect()
}

/// Extensions provided by the loader and implicit layers.
///
/// # Safety
/// `entry` must hold a loaded Vulkan library.
pub unsafe fn enumerate_instance_extensions(entry: &ash::Entry) -> VkResult<Vec<std::ffi::CString>> {
    let fp = entry.fp_v1_0();
    let exts = enumerate_stable(|count, data| unsafe {
        (fp.enumerate_instance_extension_properties)(std::ptr::null(), count, data)
    })?;
    Ok(extension_names(&exts))
}

/// # Safety
/// `physical` must have been enumerated from `instance`.
pub unsafe fn enumerate_device_layers(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
) -> VkResult<Vec<LayerProperties>> {
    let fp = instance.fp_v1_0();
    let layers = enumerate_stable(|count, data| unsafe {
        (fp.enumerate_device_layer_properties)(physical, count, data)
    })?;
    layers
        .iter()
        .map(|l| {
            let name = raw_name(&l.layer_name);
            let exts = enumerate_stable(|count, data| unsafe {
                (fp.enumerate_device_extension_properties)(physical, name.as_ptr(), count, data)
            })?;
            Ok(LayerProperties {
                name: name.to_owned(),
                description: raw_name(&l.description).to_string_lossy().into_owned(),
                extensions: extension_names(&exts),
            })
        })
        .collect()
}

/// # Safety
/// `physical` must have been enumerated from `instance`.
pub unsafe fn enumerate_device_extensions(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
) -> VkResult<Vec<std::ffi::CString>> {
    let fp = instance.fp_v1_0();
    let exts = enumerate_stable(|count, data| unsafe {
        (fp.enumerate_device_extension_properties)(physical, std::ptr::null(), count, data)
    })?;
    Ok(extension_names(&exts))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe {
        let p = (*data).p_message;
        if p.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(p).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{types:?}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "[{types:?}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!(target: "vulkan", "[{types:?}] {msg}");
    } else {
        debug!(target: "vulkan", "[{types:?}] {msg}");
    }
    vk::FALSE
}

/// Forwards validation output into `tracing`.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// # Safety
    /// `instance` must have been created with `VK_EXT_debug_utils` enabled.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> VkResult<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let handle = unsafe { loader.create_debug_utils_messenger(&info, None)? };
        Ok(Self { loader, handle })
    }

    /// # Safety
    /// Must run before the instance is destroyed.
    pub unsafe fn destroy(self) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn shared_family_preferred() {
        let fams = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let sel = select_queue_families(&fams, |i| i != 1).unwrap();
        assert_eq!(sel, QueueSelection { graphics: 2, present: 2 });
        assert!(sel.is_shared());
    }

    #[test]
    fn separate_present_family() {
        let fams = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let sel = select_queue_families(&fams, |i| i == 1).unwrap();
        assert_eq!(sel, QueueSelection { graphics: 0, present: 1 });
        assert!(!sel.is_shared());
    }

    #[test]
    fn missing_queues_are_errors() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            select_queue_families(&compute_only, |_| true),
            Err(ContextError::NoGraphicsQueue)
        ));
        let no_present = [family(vk::QueueFlags::GRAPHICS)];
        assert!(matches!(
            select_queue_families(&no_present, |_| false),
            Err(ContextError::NoPresentQueue)
        ));
        assert_eq!(first_graphics_family(&compute_only), None);
        assert_eq!(first_graphics_family(&no_present), Some(0));
    }

    #[test]
    fn depth_format_follows_priority() {
        let supported = |f: vk::Format| vk::FormatProperties {
            optimal_tiling_features: if f == vk::Format::D32_SFLOAT_S8_UINT
                || f == vk::Format::D16_UNORM_S8_UINT
            {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            },
            ..Default::default()
        };
        assert_eq!(pick_depth_format(supported), Some(vk::Format::D32_SFLOAT_S8_UINT));
        assert_eq!(pick_depth_format(|_| vk::FormatProperties::default()), None);
    }

    #[test]
    fn memory_type_matches_bits_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(memory_type_from_properties(&props, 0b111, local), Some(1));
        assert_eq!(memory_type_from_properties(&props, 0b101, local), Some(2));
        assert_eq!(memory_type_from_properties(&props, 0b001, local), None);
        assert_eq!(
            memory_type_from_properties(&props, 0b001, vk::MemoryPropertyFlags::empty()),
            Some(0)
        );
    }
}
