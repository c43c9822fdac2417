// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Initialization failures. The display string of every variant is also what
/// `VulkanContext::init_error` reports.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Failed to load Vulkan driver library: {0}")]
    Loader(String),
    #[error("Failed to create Vulkan instance: {0}")]
    Instance(vk::Result),
    #[error("Failed to enumerate physical devices: {0}")]
    Enumerate(vk::Result),
    #[error("No Vulkan-capable physical device found")]
    NoPhysicalDevice,
    #[error("Physical device index {index} out of range ({count} available)")]
    BadDeviceIndex { index: usize, count: usize },
    #[error("No graphics-capable queue family")]
    NoGraphicsQueue,
    #[error("Could not find a graphics and a present queue")]
    NoPresentQueue,
    #[error("Unable to create Vulkan device: {0}")]
    Device(vk::Result),
    #[error("Failed to create window surface: {0}")]
    Surface(String),
    #[error("Failed to create swapchain: {0}")]
    Swapchain(vk::Result),
    #[error("Vulkan init failed earlier: {0}")]
    Earlier(String),
    #[error("{0} has not been initialized")]
    NotInitialized(&'static str),
    #[error(transparent)]
    Vulkan(#[from] vk::Result),
}

/// Steady-state failures of the frame loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The swapchain no longer matches the surface. Recreate it and retry the frame.
    #[error("swapchain out of date")]
    SwapchainOutOfDate,
    #[error("device lost")]
    DeviceLost,
    #[error("begin_frame called while a frame is already open")]
    Reentrant,
    #[error("no frame is being recorded")]
    NotRecording,
    /// Bring-up or the last swapchain rebuild failed; nothing renders until
    /// the context is initialized again.
    #[error("context is not ready to render")]
    NotInitialized,
    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl FrameError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::SwapchainOutOfDate)
    }
}

impl From<vk::Result> for FrameError {
    fn from(res: vk::Result) -> Self {
        classify_result(res)
    }
}

/// Splits raw API failures into "recreate the swapchain" and "give up".
pub fn classify_result(res: vk::Result) -> FrameError {
    match res {
        vk::Result::ERROR_OUT_OF_DATE_KHR
        | vk::Result::SUBOPTIMAL_KHR
        | vk::Result::ERROR_SURFACE_LOST_KHR => FrameError::SwapchainOutOfDate,
        vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
        other => FrameError::Vulkan(other),
    }
}

/// Outcome of a successful present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the swapchain should be recreated soon.
    Suboptimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_and_suboptimal_are_recoverable() {
        for res in [
            vk::Result::ERROR_OUT_OF_DATE_KHR,
            vk::Result::SUBOPTIMAL_KHR,
            vk::Result::ERROR_SURFACE_LOST_KHR,
        ] {
            let err = classify_result(res);
            assert_eq!(err, FrameError::SwapchainOutOfDate);
            assert!(err.is_recoverable());
        }
    }

    #[test]
    fn device_lost_is_fatal() {
        let err: FrameError = vk::Result::ERROR_DEVICE_LOST.into();
        assert_eq!(err, FrameError::DeviceLost);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn other_errors_stay_fatal_and_keep_the_code() {
        let err = classify_result(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(err, FrameError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(!err.is_recoverable());
        assert!(!FrameError::Reentrant.is_recoverable());
    }

    #[test]
    fn init_errors_read_like_diagnostics() {
        let msg = ContextError::Device(vk::Result::ERROR_FEATURE_NOT_PRESENT).to_string();
        assert!(msg.starts_with("Unable to create Vulkan device"));
        assert_eq!(
            ContextError::NotInitialized("device").to_string(),
            "device has not been initialized"
        );
    }
}
