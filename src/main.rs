//! Neondrive - an audio-reactive procedural night city.
//!
//! A signal (decoded file or microphone) drives the heights and colors of an
//! infinitely scrolling instanced skyline; without a signal the city idles on
//! its ambient motion.

mod animate;
mod audio;
mod bridge;
mod cli;
mod params;
mod rendering;
mod scene;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64;
use tracing::{error, info, warn};
use winit::{
    application::ApplicationHandler,
    event::*,
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use animate::AnimationScheduler;
use audio::{AudioError, AudioSource, AudioSourceManager, SpectralAnalyzer};
use cli::Args;
use params::{AnalyzerConfig, DriveParams, PaletteParams, RenderConfig, SceneLayout};
use rendering::{view_proj, RenderSystem, Uniforms};
use scene::SceneModel;

/// Main application state
struct App {
    // Window and rendering
    window: Option<Arc<Window>>,
    render_system: Option<RenderSystem>,

    // Simulation systems
    scheduler: Option<AnimationScheduler>,
    audio_manager: AudioSourceManager,
    analyzer: SpectralAnalyzer,

    // Configuration
    render_config: RenderConfig,
    drive: DriveParams,
    seed: u64,
    initial_source: Option<AudioSource>,

    // Time tracking
    start_time: Instant,
}

impl App {
    fn new(args: &Args) -> anyhow::Result<Self> {
        let analyzer_config = AnalyzerConfig {
            fft_size: args.fft_size,
            ..Default::default()
        };
        let analyzer = SpectralAnalyzer::new(analyzer_config.clone())
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid analyzer configuration")?;
        let audio_manager = AudioSourceManager::new(&analyzer_config);

        let seed = args.seed.unwrap_or_else(|| rand::thread_rng().next_u64());
        info!(seed, "scene seed");

        Ok(Self {
            window: None,
            render_system: None,
            scheduler: None,
            audio_manager,
            analyzer,
            render_config: RenderConfig::default(),
            drive: DriveParams::default(),
            seed,
            initial_source: args.audio_source(),
            start_time: Instant::now(),
        })
    }

    /// Attach a source; permission and decode failures keep the idle
    /// animation running instead of tearing anything down.
    fn try_start_source(&mut self, source: AudioSource) {
        match self.audio_manager.start(source) {
            Ok(()) => {}
            Err(e @ (AudioError::PermissionDenied | AudioError::Decode(_))) => {
                warn!(error = %e, "audio source unavailable, running idle");
            }
            Err(e) => {
                warn!(error = %e, "audio source failed");
            }
        }
    }

    /// Render a single frame
    fn render_frame(&mut self) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let Some(render_system) = self.render_system.as_mut() else {
            return;
        };

        let time_s = self.start_time.elapsed().as_secs_f32();

        // Pull the current spectrum; a silent or missing source yields zero
        // energy and the ambient terms carry the animation.
        let tap = self.audio_manager.tap();
        let frame = self.analyzer.sample(tap.as_deref());
        let bands = self.analyzer.derive_band_energy(&frame);

        let stats = scheduler.tick(time_s, &bands, render_system);

        let (width, height) = render_system.size();
        let uniforms = Uniforms {
            view_proj: view_proj(&self.render_config, width, height).to_cols_array_2d(),
            camera_pos: {
                let [x, y, z] = self.render_config.camera_eye;
                [x, y, z, 0.0]
            },
            env: [
                self.render_config.fog_density,
                stats.grid_offset,
                self.drive.grid_unit_m,
                time_s,
            ],
        };
        render_system.update_uniforms(&uniforms);

        match render_system.render() {
            Ok(()) => {}
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                let (width, height) = render_system.size();
                bridge::RendererBridge::resize(render_system, width, height);
            }
            Err(e) => error!(error = %e, "render error"),
        }
    }

    fn toggle_playback(&mut self) {
        if self.audio_manager.is_playing() {
            self.audio_manager.pause();
            info!("paused");
        } else {
            // The user gesture that satisfies audio policy.
            match self.audio_manager.resume_if_suspended() {
                Ok(()) => info!("playing"),
                Err(e) => warn!(error = %e, "could not resume audio"),
            }
        }
    }
}

impl ApplicationHandler for App {
    fn about_to_wait(&mut self, _event_loop: &winit::event_loop::ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        if self.window.is_some() {
            return; // Already initialized
        }

        let window_attributes = Window::default_attributes()
            .with_title("Neondrive - Audio-Reactive City")
            .with_inner_size(winit::dpi::LogicalSize::new(
                self.render_config.window_width,
                self.render_config.window_height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                error!(error = %e, "window creation failed");
                event_loop.exit();
                return;
            }
        };

        // No capable graphics context is fatal; there is no fallback.
        let mut render_system =
            match pollster::block_on(RenderSystem::new(Arc::clone(&window), &self.render_config))
            {
                Ok(render_system) => render_system,
                Err(e) => {
                    error!(error = %e, "renderer initialization failed");
                    event_loop.exit();
                    return;
                }
            };

        let mut rng = Pcg64::seed_from_u64(self.seed);
        let scene = SceneModel::build(SceneLayout::default(), &mut rng);
        let scheduler = AnimationScheduler::new(
            scene,
            self.drive.clone(),
            PaletteParams::default(),
            self.seed,
            &mut render_system,
        );

        if let Some(source) = self.initial_source.take() {
            self.try_start_source(source);
        }

        info!("Neondrive is running. Space: play/pause, Esc: quit.");

        self.window = Some(window);
        self.render_system = Some(render_system);
        self.scheduler = Some(scheduler);
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                self.audio_manager.stop();
                event_loop.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        state: ElementState::Pressed,
                        physical_key: PhysicalKey::Code(code),
                        repeat: false,
                        ..
                    },
                ..
            } => match code {
                KeyCode::Escape => {
                    self.audio_manager.stop();
                    event_loop.exit();
                }
                KeyCode::Space => self.toggle_playback(),
                _ => {}
            },
            WindowEvent::Resized(size) => {
                if let Some(render_system) = self.render_system.as_mut() {
                    bridge::RendererBridge::resize(render_system, size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                self.render_frame();
            }
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neondrive=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut app = App::new(&args)?;

    let event_loop = EventLoop::new().context("event loop creation failed")?;
    event_loop.run_app(&mut app)?;
    Ok(())
}
