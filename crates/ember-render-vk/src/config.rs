// SPDX-License-Identifier: CEPL-1.0
use bitflags::bitflags;
use ember_render::{PresentModePreference, RenderSettings};

/// Upper bound on frames the CPU may run ahead of the GPU.
pub const MAX_INFLIGHT_FRAMES: usize = 3;

bitflags! {
    /// Construction-time switches.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// Load the validation layer and a debug messenger when available.
        const VALIDATE             = 1 << 0;
        const PRESENT_MAILBOX      = 1 << 1;
        const PRESENT_FIFO_RELAXED = 1 << 2;
        const PRESENT_IMMEDIATE    = 1 << 3;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    pub app_name: String,
    pub app_version: u32,
    pub flags: ContextFlags,
    pub inflight_frames: usize,
    /// Give the surface render pass a depth/stencil attachment.
    pub depth: bool,
    /// Clear the color attachment on load instead of preserving it.
    pub clear_on_load: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "ember".into(),
            app_version: 1,
            flags: ContextFlags::empty(),
            inflight_frames: 2,
            depth: true,
            clear_on_load: true,
        }
    }
}

impl ContextConfig {
    pub fn from_settings(app_name: &str, settings: &RenderSettings) -> Self {
        let mut flags = ContextFlags::empty();
        flags.set(ContextFlags::VALIDATE, settings.validation);
        flags |= match settings.present_mode {
            PresentModePreference::Fifo => ContextFlags::empty(),
            PresentModePreference::Mailbox => ContextFlags::PRESENT_MAILBOX,
            PresentModePreference::FifoRelaxed => ContextFlags::PRESENT_FIFO_RELAXED,
            PresentModePreference::Immediate => ContextFlags::PRESENT_IMMEDIATE,
        };
        Self {
            app_name: app_name.to_owned(),
            flags,
            inflight_frames: settings.inflight_frames,
            depth: settings.depth,
            ..Self::default()
        }
    }

    /// Number of frame slots actually allocated.
    pub fn inflight(&self) -> usize {
        self.inflight_frames.clamp(1, MAX_INFLIGHT_FRAMES)
    }

    pub fn validate(&self) -> bool {
        self.flags.contains(ContextFlags::VALIDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_is_clamped() {
        let mut cfg = ContextConfig::default();
        cfg.inflight_frames = 0;
        assert_eq!(cfg.inflight(), 1);
        cfg.inflight_frames = 8;
        assert_eq!(cfg.inflight(), MAX_INFLIGHT_FRAMES);
        cfg.inflight_frames = 2;
        assert_eq!(cfg.inflight(), 2);
    }

    #[test]
    fn settings_map_to_flags() {
        let settings = RenderSettings {
            validation: true,
            present_mode: PresentModePreference::FifoRelaxed,
            inflight_frames: 3,
            depth: false,
            ..RenderSettings::default()
        };
        let cfg = ContextConfig::from_settings("demo", &settings);
        assert_eq!(cfg.app_name, "demo");
        assert_eq!(
            cfg.flags,
            ContextFlags::VALIDATE | ContextFlags::PRESENT_FIFO_RELAXED
        );
        assert!(cfg.validate());
        assert!(!cfg.depth);
        assert_eq!(cfg.inflight(), 3);
    }

    #[test]
    fn fifo_sets_no_present_flag() {
        let settings = RenderSettings {
            validation: false,
            present_mode: PresentModePreference::Fifo,
            ..RenderSettings::default()
        };
        assert!(ContextConfig::from_settings("x", &settings).flags.is_empty());
    }
}
