// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use tilemerge_core::init_tracing;
use tilemerge_game::{Direction, GameMemory, DEFAULT_SEED};
use tilemerge_platform::WindowGate;
use tilemerge_render::{PresentPreference, RenderSettings, RenderSize, Renderer};
use tilemerge_render_vk::VkRenderer;
use tracing::{debug, error, info, warn};

use tilemerge_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file; missing means defaults.
    #[arg(long, default_value = "tilemerge.toml")]
    config: PathBuf,
    /// Overrides `[render] frames_in_flight`.
    #[arg(long)]
    frames_in_flight: Option<usize>,
    /// Overrides `[render] present_mode`: mailbox | fifo | immediate
    #[arg(long)]
    present_mode: Option<PresentPreference>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
struct WindowCfg {
    title: String,
    width: u32,
    height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "game".into(),
            width: 1200,
            height: 800,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
struct GameCfg {
    seed: u64,
}

impl Default for GameCfg {
    fn default() -> Self {
        Self { seed: DEFAULT_SEED }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
struct AppCfg {
    window: WindowCfg,
    render: RenderSettings,
    game: GameCfg,
}

fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(text) => match parse_cfg(&text) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("ignoring malformed {}: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("no {}; using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("cannot read {}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

fn apply_overrides(cfg: &mut AppCfg, args: &Args) {
    if let Some(n) = args.frames_in_flight {
        cfg.render.frames_in_flight = n;
    }
    if let Some(mode) = args.present_mode {
        cfg.render.present_mode = mode;
    }
    cfg.render.app_name = cfg.window.title.clone();
}

fn direction_for(key: &Key) -> Option<Direction> {
    match key {
        Key::Named(NamedKey::ArrowLeft) => Some(Direction::Left),
        Key::Named(NamedKey::ArrowRight) => Some(Direction::Right),
        Key::Named(NamedKey::ArrowUp) => Some(Direction::Up),
        Key::Named(NamedKey::ArrowDown) => Some(Direction::Down),
        _ => None,
    }
}

struct App {
    cfg: AppCfg,
    // Declared before `window`: the renderer's surface must go first.
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    memory: GameMemory,
    gate: WindowGate,

    exiting: bool,
    failed: bool,
    last_presented: bool,
    frames: u32,
    last_fps_instant: Instant,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn new(cfg: AppCfg, memory: GameMemory) -> Self {
        let gate = WindowGate::new(cfg.window.width, cfg.window.height);
        Self {
            cfg,
            renderer: None,
            window: None,
            memory,
            gate,
            exiting: false,
            failed: false,
            last_presented: false,
            frames: 0,
            last_fps_instant: Instant::now(),
            next_frame_deadline: None,
        }
    }

    /// Single exit path for anything unrecoverable: log, tear down, leave.
    fn fatal(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("fatal: {err:#}");
        self.failed = true;
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn refresh_visibility(&mut self) {
        if let Some(w) = &self.window {
            self.gate.sync_visibility(w.is_visible());
        }
    }

    fn request_redraw(&self) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn create_window_and_renderer(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.cfg.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.cfg.window.width, self.cfg.window.height));
        let window = event_loop.create_window(attrs)?;
        let size = window.inner_size();
        self.gate.set_size(size.width, size.height);

        let mut renderer = VkRenderer::new(
            &window,
            &window,
            RenderSize {
                width: size.width,
                height: size.height,
            },
            &self.cfg.render,
        )?;
        renderer.set_clear_color(self.cfg.render.clear_color);
        info!(
            "window {}x{}, vsync={}",
            size.width,
            size.height,
            renderer.device_does_vsync()
        );
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn on_key(&mut self, event_loop: &ActiveEventLoop, event: &KeyEvent) {
        if event.state != ElementState::Pressed {
            return;
        }
        if event.logical_key == Key::Named(NamedKey::Escape) {
            info!("escape pressed");
            self.shutdown(event_loop);
            return;
        }
        let Some(dir) = direction_for(&event.logical_key) else {
            return;
        };
        let Some(game) = self.memory.game_mut() else {
            return;
        };
        match game.apply(dir) {
            Ok(true) => self.request_redraw(),
            Ok(false) => {}
            Err(e) => self.fatal(event_loop, e.into()),
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting || !self.gate.should_render() {
            self.last_presented = false;
            return;
        }
        let (Some(renderer), Some(game)) = (self.renderer.as_mut(), self.memory.game()) else {
            return;
        };
        match renderer.render(game) {
            Ok(outcome) => {
                self.last_presented = outcome.presented();
                if self.last_presented {
                    self.frames = self.frames.saturating_add(1);
                }
            }
            Err(e) => self.fatal(event_loop, e),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.window.is_some() {
            self.gate.set_visible(true);
            self.refresh_visibility();
            self.request_redraw();
            return;
        }
        if let Err(e) = self.create_window_and_renderer(event_loop) {
            self.fatal(event_loop, e);
            return;
        }
        self.refresh_visibility();
        self.request_redraw();
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        debug!("suspended");
        self.gate.set_visible(false);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }
        self.gate.observe(&event);

        match event {
            WindowEvent::CloseRequested => {
                info!("close requested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.refresh_visibility();
                if let Some(r) = &mut self.renderer {
                    r.resize(RenderSize {
                        width: new_size.width,
                        height: new_size.height,
                    });
                }
                self.request_redraw();
            }

            WindowEvent::Occluded(occluded) => {
                debug!(occluded, "occlusion changed");
                self.refresh_visibility();
                if !occluded {
                    self.request_redraw();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => self.on_key(event_loop, &event),

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if !self.gate.should_render() {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.next_frame_deadline = None;
            self.frames = 0;
            return;
        }

        let vsync = self
            .renderer
            .as_ref()
            .is_some_and(|r| r.device_does_vsync());
        if vsync && self.last_presented {
            // FIFO presentation blocks for us.
            event_loop.set_control_flow(ControlFlow::Wait);
            self.request_redraw();
        } else {
            let now = Instant::now();
            let frame_dt =
                Duration::from_nanos(1_000_000_000u64 / u64::from(self.cfg.render.fallback_fps.max(1)));
            match self.next_frame_deadline {
                Some(t) if now < t => event_loop.set_control_flow(ControlFlow::WaitUntil(t)),
                _ => {
                    let next = now + frame_dt;
                    self.next_frame_deadline = Some(next);
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                    self.request_redraw();
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant) >= Duration::from_secs(1) {
            debug!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn run(args: Args) -> Result<bool> {
    let mut cfg = load_cfg(&args.config);
    apply_overrides(&mut cfg, &args);

    let memory = GameMemory::reserve().init(cfg.game.seed)?;
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, memory);
    event_loop.run_app(&mut app)?;

    // Normally already gone; make sure teardown happens before the records go.
    app.renderer = None;
    app.window = None;
    let freed = app.memory.release();
    debug!(?freed, "shutdown complete");
    Ok(!app.failed)
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
