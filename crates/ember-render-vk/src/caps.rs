// SPDX-License-Identifier: CEPL-1.0
//! Layer / extension / optional-feature negotiation.
//!
//! Nothing in here ever enables a name or feature that is missing from the
//! queried availability lists; a miss is reported and skipped.

use std::ffi::{c_char, CStr, CString};

use ash::prelude::VkResult;
use ash::vk;
use bitflags::bitflags;
use tracing::{debug, warn};

/// A layer together with the extensions it exposes.
#[derive(Clone, Debug, Default)]
pub struct LayerProperties {
    pub name: CString,
    pub description: String,
    pub extensions: Vec<CString>,
}

/// Reads a fixed-size, NUL-terminated name as returned by the driver.
pub fn raw_name(raw: &[c_char]) -> &CStr {
    let bytes: &[u8] = bytemuck::cast_slice(raw);
    CStr::from_bytes_until_nul(bytes).unwrap_or(c"")
}

/// Runs a count-then-fill enumeration until the driver stops answering
/// `INCOMPLETE`. The element count may change between the two calls when
/// layers are installed or removed concurrently.
pub fn enumerate_stable<T: Default + Clone>(
    mut query: impl FnMut(&mut u32, *mut T) -> vk::Result,
) -> VkResult<Vec<T>> {
    loop {
        let mut count = 0u32;
        query(&mut count, std::ptr::null_mut()).result()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut data = vec![T::default(); count as usize];
        match query(&mut count, data.as_mut_ptr()) {
            vk::Result::INCOMPLETE => continue,
            vk::Result::SUCCESS => {
                data.truncate(count as usize);
                return Ok(data);
            }
            err => return Err(err),
        }
    }
}

/// Returns the first requested layer that is absent from `available`.
pub fn first_missing_layer<'a>(
    available: &[LayerProperties],
    requested: &'a [CString],
) -> Option<&'a CStr> {
    requested
        .iter()
        .find(|want| !available.iter().any(|l| l.name.as_c_str() == want.as_c_str()))
        .map(CString::as_c_str)
}

/// True when every requested layer is available. Reports the first miss.
pub fn check_layers(available: &[LayerProperties], requested: &[CString]) -> bool {
    match first_missing_layer(available, requested) {
        Some(missing) => {
            warn!("Cannot find layer: {}", missing.to_string_lossy());
            false
        }
        None => true,
    }
}

bitflags! {
    /// Optional device features the context turns on when the device has them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OptionalFeatures: u32 {
        const DUAL_SRC_BLEND      = 1 << 0;
        const LARGE_POINTS        = 1 << 1;
        const WIDE_LINES          = 1 << 2;
        const GEOMETRY_SHADER     = 1 << 3;
        const LOGIC_OP            = 1 << 4;
        const DEPTH_CLAMP         = 1 << 5;
        const DEPTH_BOUNDS        = 1 << 6;
        const SAMPLER_ANISOTROPY  = 1 << 7;
        const FILL_MODE_NON_SOLID = 1 << 8;
    }
}

impl OptionalFeatures {
    /// The curated set that is safe to request.
    pub const CURATED: Self = Self::all();

    pub fn from_vk(f: &vk::PhysicalDeviceFeatures) -> Self {
        let mut out = Self::empty();
        out.set(Self::DUAL_SRC_BLEND, f.dual_src_blend == vk::TRUE);
        out.set(Self::LARGE_POINTS, f.large_points == vk::TRUE);
        out.set(Self::WIDE_LINES, f.wide_lines == vk::TRUE);
        out.set(Self::GEOMETRY_SHADER, f.geometry_shader == vk::TRUE);
        out.set(Self::LOGIC_OP, f.logic_op == vk::TRUE);
        out.set(Self::DEPTH_CLAMP, f.depth_clamp == vk::TRUE);
        out.set(Self::DEPTH_BOUNDS, f.depth_bounds == vk::TRUE);
        out.set(Self::SAMPLER_ANISOTROPY, f.sampler_anisotropy == vk::TRUE);
        out.set(Self::FILL_MODE_NON_SOLID, f.fill_mode_non_solid == vk::TRUE);
        out
    }

    pub fn to_vk(self) -> vk::PhysicalDeviceFeatures {
        let b = |flag: Self| if self.contains(flag) { vk::TRUE } else { vk::FALSE };
        vk::PhysicalDeviceFeatures {
            dual_src_blend: b(Self::DUAL_SRC_BLEND),
            large_points: b(Self::LARGE_POINTS),
            wide_lines: b(Self::WIDE_LINES),
            geometry_shader: b(Self::GEOMETRY_SHADER),
            logic_op: b(Self::LOGIC_OP),
            depth_clamp: b(Self::DEPTH_CLAMP),
            depth_bounds: b(Self::DEPTH_BOUNDS),
            sampler_anisotropy: b(Self::SAMPLER_ANISOTROPY),
            fill_mode_non_solid: b(Self::FILL_MODE_NON_SOLID),
            ..Default::default()
        }
    }
}

/// Everything the instance and device are created with.
#[derive(Debug, Default)]
pub struct Capabilities {
    pub instance_layers: Vec<LayerProperties>,
    pub instance_extensions: Vec<CString>,
    pub device_layers: Vec<LayerProperties>,
    pub device_extensions: Vec<CString>,

    pub enabled_instance_layers: Vec<CString>,
    pub enabled_instance_extensions: Vec<CString>,
    pub enabled_device_layers: Vec<CString>,
    pub enabled_device_extensions: Vec<CString>,

    pub features_available: OptionalFeatures,
    pub features_enabled: OptionalFeatures,
}

fn contains(list: &[CString], name: &CStr) -> bool {
    list.iter().any(|n| n.as_c_str() == name)
}

fn push_unique(list: &mut Vec<CString>, name: &CStr) {
    if !contains(list, name) {
        list.push(name.to_owned());
    }
}

impl Capabilities {
    /// Instance extension lookup across the loader list and every layer's list.
    pub fn instance_extension_available(&self, name: &CStr) -> bool {
        contains(&self.instance_extensions, name)
            || self
                .instance_layers
                .iter()
                .any(|l| contains(&l.extensions, name))
    }

    /// Enables `name` at instance level if it was enumerated.
    pub fn enable_instance_extension(&mut self, name: &CStr) -> bool {
        if !self.instance_extension_available(name) {
            debug!("instance extension {} unavailable", name.to_string_lossy());
            return false;
        }
        push_unique(&mut self.enabled_instance_extensions, name);
        true
    }

    /// Enables `name` at device level if the chosen device reported it.
    /// `false` means "feature unavailable", never a fatal condition.
    pub fn enable_device_extension(&mut self, name: &CStr) -> bool {
        if !contains(&self.device_extensions, name) {
            debug!("device extension {} unavailable", name.to_string_lossy());
            return false;
        }
        push_unique(&mut self.enabled_device_extensions, name);
        true
    }

    /// Requests validation-style layers at both levels, keeping only the ones
    /// the instance reports.
    pub fn request_layers(&mut self, names: &[&CStr]) {
        let requested: Vec<CString> = names.iter().map(|n| (*n).to_owned()).collect();
        if !check_layers(&self.instance_layers, &requested) {
            warn!("some requested layers are unavailable; continuing without them");
        }
        for name in requested {
            if self.instance_layers.iter().any(|l| l.name == name) {
                push_unique(&mut self.enabled_instance_layers, &name);
                push_unique(&mut self.enabled_device_layers, &name);
            }
        }
    }

    pub fn clear_layers(&mut self) {
        self.enabled_instance_layers.clear();
        self.enabled_device_layers.clear();
    }

    /// Intersects the wanted optional features with what the device offers.
    pub fn enable_features(&mut self, available: OptionalFeatures, wanted: OptionalFeatures) {
        self.features_available = available;
        self.features_enabled = available & wanted;
        let skipped = wanted - available;
        if !skipped.is_empty() {
            debug!("optional features unavailable: {skipped:?}");
        }
    }
}

pub(crate) fn name_ptrs(names: &[CString]) -> Vec<*const c_char> {
    names.iter().map(|n| n.as_ptr()).collect()
}

pub(crate) fn extension_names(props: &[vk::ExtensionProperties]) -> Vec<CString> {
    props
        .iter()
        .map(|p| raw_name(&p.extension_name).to_owned())
        .collect()
}
