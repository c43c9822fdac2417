// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ember_core::init_tracing;
use ember_platform::WindowSurface;
use ember_render::{PresentModePreference, RenderSettings, RenderSize, Renderer};
use ember_render_vk::VkRenderer;
use serde::Deserialize;
use tracing::{error, info, warn};

use ember_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file to read.
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// Force the validation layer on.
    #[arg(long)]
    validation: bool,
    /// Present mode to ask for: fifo | mailbox | fifo-relaxed | immediate
    #[arg(long, value_enum)]
    present_mode: Option<PresentModeArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PresentModeArg {
    Fifo,
    Mailbox,
    FifoRelaxed,
    Immediate,
}

impl From<PresentModeArg> for PresentModePreference {
    fn from(m: PresentModeArg) -> Self {
        match m {
            PresentModeArg::Fifo => PresentModePreference::Fifo,
            PresentModeArg::Mailbox => PresentModePreference::Mailbox,
            PresentModeArg::FifoRelaxed => PresentModePreference::FifoRelaxed,
            PresentModeArg::Immediate => PresentModePreference::Immediate,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: RenderSettings,
}

fn parse_cfg(src: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(src)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

fn apply_args(mut settings: RenderSettings, args: &Args) -> RenderSettings {
    if args.validation {
        settings.validation = true;
    }
    if let Some(mode) = args.present_mode {
        settings.present_mode = mode.into();
    }
    settings
}

struct App {
    settings: RenderSettings,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,

    exiting: bool,
    paused: bool,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            window: None,
            renderer: None,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            exiting: false,
            paused: false,
            frames: 0,
            last_fps_instant: Instant::now(),
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        // renderer first: it still references the window's surface
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = match event_loop.create_window(Window::default_attributes().with_title("ember")) {
                Ok(w) => w,
                Err(e) => {
                    error!("create_window: {e}");
                    self.shutdown(event_loop);
                    return;
                }
            };
            let size = window.inner_size();
            self.render_size = RenderSize {
                width: size.width.max(1),
                height: size.height.max(1),
            };

            match VkRenderer::new(&WindowSurface::new(&window), &self.settings) {
                Ok(r) => self.renderer = Some(r),
                Err(e) => {
                    error!("vk init failed: {e:#}");
                    self.shutdown(event_loop);
                    return;
                }
            }
            info!(
                "present_mode cfg = {:?}, validation = {}",
                self.settings.present_mode, self.settings.validation
            );
            self.window = Some(window);
        } else {
            // Resumed with a live window: its native surface may be new.
            let res = match (&self.window, &mut self.renderer) {
                (Some(w), Some(r)) => r.reinit_surface(&WindowSurface::new(w)),
                _ => Ok(()),
            };
            if let Err(e) = res {
                error!("surface reinit failed: {e:#}");
                self.shutdown(event_loop);
                return;
            }
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        self.paused = self.render_size.is_zero();
        info!("resumed → paused={}", self.paused);
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                let now_paused = self.render_size.is_zero();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        self.render_size.width, self.render_size.height, self.paused
                    );
                }
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(self.render_size) {
                        error!("resize failed: {e:#}");
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.is_zero();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(r) = &mut self.renderer else {
                    return;
                };
                match r.render() {
                    Ok(()) => self.frames = self.frames.saturating_add(1),
                    Err(e) => {
                        error!("render error: {e:#}");
                        self.shutdown(event_loop);
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing("info");
    let args = Args::parse();
    let settings = apply_args(load_cfg(&args.config).render, &args);
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(settings);
    event_loop.run_app(&mut app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file() {
        let cfg = parse_cfg("[render]\npresent_mode = \"fifo\"\nvalidation = false\n").unwrap();
        let args = Args::parse_from(["ember", "--validation", "--present-mode", "immediate"]);
        let s = apply_args(cfg.render, &args);
        assert!(s.validation);
        assert_eq!(s.present_mode, PresentModePreference::Immediate);
    }

    #[test]
    fn file_values_survive_without_flags() {
        let cfg = parse_cfg("[render]\npresent_mode = \"fifo_relaxed\"\n").unwrap();
        let args = Args::parse_from(["ember"]);
        let s = apply_args(cfg.render, &args);
        assert_eq!(s.present_mode, PresentModePreference::FifoRelaxed);
        assert_eq!(args.config, PathBuf::from("ember.toml"));
    }

    #[test]
    fn malformed_or_missing_file_gives_defaults() {
        assert!(parse_cfg("[render\n").is_err());
        let cfg = load_cfg(Path::new("definitely/not/here/ember.toml"));
        assert_eq!(cfg.render, RenderSettings::default());
    }
}
