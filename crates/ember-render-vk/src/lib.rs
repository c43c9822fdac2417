// SPDX-License-Identifier: CEPL-1.0
//! Vulkan rendering context: device bring-up, swapchain ownership, the
//! frame-in-flight ring and fence-gated destruction of GPU objects.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bootstrap;
pub mod caps;
pub mod config;
pub mod context;
pub mod deletion;
pub mod error;
pub mod frame;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod testing;

pub use bootstrap::{memory_type_from_properties, PhysicalDeviceInfo, QueueSelection};
pub use caps::{Capabilities, LayerProperties, OptionalFeatures};
pub use config::{ContextConfig, ContextFlags, MAX_INFLIGHT_FRAMES};
pub use context::VulkanContext;
pub use deletion::{DeletionHandle, PendingDestroy};
pub use error::{classify_result, ContextError, FrameError, PresentStatus};
pub use renderer::VkRenderer;
#[cfg(feature = "shaderc")]
pub use shader::ShaderCompiler;
pub use shader::{ShaderError, ShaderStage};
pub use sync::{layout_transition, LayoutTransition};
