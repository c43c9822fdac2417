// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Native drawable handed to a backend by the windowing layer.
///
/// The handles must stay valid for as long as the renderer built from them
/// is alive; `size` is queried again every time the surface is reinitialized.
pub trait SurfaceProvider {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)>;
    fn size(&self) -> RenderSize;
}

/// Which present mode to ask for. Anything other than `Fifo` is a preference:
/// the backend falls back to whatever the surface lists first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    #[default]
    Fifo,
    Mailbox,
    FifoRelaxed,
    Immediate,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub validation: bool,
    pub present_mode: PresentModePreference,
    pub inflight_frames: usize,
    pub depth: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            validation: cfg!(debug_assertions),
            present_mode: PresentModePreference::Mailbox,
            inflight_frames: 2,
            depth: true,
        }
    }
}

pub trait Renderer {
    fn new(surface: &dyn SurfaceProvider, settings: &RenderSettings) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    /// The native window behind `surface` was recreated; rebuild everything
    /// bound to the old one. Backends without a window-bound surface ignore it.
    fn reinit_surface(&mut self, _surface: &dyn SurfaceProvider) -> Result<()> {
        Ok(())
    }
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default)]
        render: RenderSettings,
    }

    #[test]
    fn empty_table_uses_defaults() {
        let w: Wrapper = toml::from_str("").unwrap();
        assert_eq!(w.render, RenderSettings::default());
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let src = r#"
            [render]
            present_mode = "fifo_relaxed"
            inflight_frames = 3
        "#;
        let w: Wrapper = toml::from_str(src).unwrap();
        assert_eq!(w.render.present_mode, PresentModePreference::FifoRelaxed);
        assert_eq!(w.render.inflight_frames, 3);
        assert!(w.render.depth);
        assert_eq!(w.render.clear_color, RenderSettings::default().clear_color);
    }

    #[test]
    fn unknown_present_mode_is_rejected() {
        let src = "[render]\npresent_mode = \"triple\"\n";
        assert!(toml::from_str::<Wrapper>(src).is_err());
    }

    struct Headless {
        size: RenderSize,
    }

    impl SurfaceProvider for Headless {
        fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
            anyhow::bail!("headless")
        }
        fn size(&self) -> RenderSize {
            self.size
        }
    }

    struct Counting {
        frames: u32,
    }

    impl Renderer for Counting {
        fn new(_surface: &dyn SurfaceProvider, _settings: &RenderSettings) -> Result<Self> {
            Ok(Counting { frames: 0 })
        }
        fn resize(&mut self, _size: RenderSize) -> Result<()> {
            Ok(())
        }
        fn render(&mut self) -> Result<()> {
            self.frames += 1;
            Ok(())
        }
        fn set_clear_color(&mut self, _rgba: [f32; 4]) {}
    }

    #[test]
    fn surface_reinit_defaults_to_a_no_op() {
        let surface = Headless {
            size: RenderSize { width: 4, height: 4 },
        };
        let mut r = Counting::new(&surface, &RenderSettings::default()).unwrap();
        r.reinit_surface(&surface).unwrap();
        r.render().unwrap();
        assert_eq!(r.frames, 1);
    }

    #[test]
    fn zero_sized_surfaces() {
        assert!(RenderSize { width: 0, height: 720 }.is_zero());
        assert!(!RenderSize { width: 1, height: 1 }.is_zero());
    }
}
