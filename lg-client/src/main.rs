//! Demo binary: wires no-op renderer/display-server collaborators to the
//! core and runs the driver against whatever shared-memory path the config
//! names. Useful for smoke-testing the transport against a synthetic region
//! (see `tests/scenarios.rs`) without a real hypervisor or GPU present.
//!
//! Mirrors `user-agent::main`'s shape: init logging, load config, spawn the
//! long-running worker, park.

use std::env;
use std::path::PathBuf;

use lg_client::{Cap, CoreError, DriverHandles};
use log::{error, info};

struct NullFrameSink {
    dmabuf: bool,
}

impl lg_client::FrameSink for NullFrameSink {
    fn on_format(&mut self, format: lg_client::FrameFormat) {
        info!(
            "format: {:?} {}x{} pitch={} rot={:?}",
            format.frame_type, format.width, format.height, format.pitch, format.rotation
        );
    }
    fn on_frame(&mut self, _payload: lg_client::FramePayload<'_>, damage_rects: &[lgmp::wire::DamageRect]) {
        log::trace!("frame delivered, {} damage rects", damage_rects.len());
    }
    fn on_restart(&mut self) {
        info!("session restarted; dropping any retained frame state");
    }
    fn supports(&self, cap: Cap) -> bool {
        matches!(cap, Cap::Dmabuf) && self.dmabuf
    }
}

struct NullCursorSink;

impl lg_client::CursorSink for NullCursorSink {
    fn on_cursor_shape(&mut self, cursor_type: lgmp::wire::CursorType, w: u32, h: u32, pitch: u32, bytes: &[u8]) {
        log::trace!("cursor shape: {cursor_type:?} {w}x{h} pitch={pitch} bytes={}", bytes.len());
    }
    fn on_cursor_state(&mut self, visible: bool, x: i16, y: i16, hx: i8, hy: i8) {
        log::trace!("cursor state: visible={visible} pos=({x},{y}) hot=({hx},{hy})");
    }
}

struct NullDisplay;

impl lg_client::DisplaySink for NullDisplay {
    fn request_activation(&self) {
        log::trace!("display: activation requested");
    }
    fn inhibit_idle(&self, inhibit: bool) {
        log::trace!("display: inhibit_idle({inhibit})");
    }
    fn guest_pointer_updated(&self, guest_x: i16, guest_y: i16, local_x: i16, local_y: i16) {
        log::trace!("display: guest pointer at ({guest_x},{guest_y}), local was ({local_x},{local_y})");
    }
}

fn find_config_file() -> PathBuf {
    if let Some(cfg) = env::var_os("LG_CLIENT_CONFIG") {
        return PathBuf::from(cfg);
    }
    let mut exe_path = env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    exe_path.pop();
    exe_path.push("config.toml");
    exe_path
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _logger = lg_client::logger::init_logger("info")?;

    let config_path = find_config_file();
    let cfg = lg_client::config::Config::load(&config_path).unwrap_or_else(|e| {
        error!("failed to load config at {config_path:?}: {e}; falling back to /dev/shm/looking-glass");
        lg_client::config::Config {
            transport: lg_client::config::TransportConfig {
                shm_path: "/dev/shm/looking-glass".into(),
                prefer_dmabuf: true,
            },
            polling: Default::default(),
            metrics: Default::default(),
        }
    });

    if cfg.metrics.enabled {
        if let Some(addr) = cfg.metrics.bind_address.as_deref() {
            match addr.parse() {
                Ok(addr) => {
                    if let Err(e) = lg_client::metrics::install(addr) {
                        error!("failed to install metrics exporter: {e}");
                    }
                }
                Err(e) => error!("invalid metrics.bind_address {addr:?}: {e}"),
            }
        }
    }

    let state = lg_client::state::new_shared_state();
    let handles = DriverHandles::new(state);

    let mut frame_sink = NullFrameSink { dmabuf: cfg.transport.prefer_dmabuf };
    let mut cursor_sink = NullCursorSink;
    let display = NullDisplay;

    info!("starting driver against {}", cfg.transport.shm_path);
    let result = lg_client::run(
        std::path::Path::new(&cfg.transport.shm_path),
        &cfg.polling,
        &handles,
        &mut frame_sink,
        &mut cursor_sink,
        &display,
    );

    match result {
        Ok(()) => {
            info!("driver exited cleanly");
            Ok(())
        }
        Err(e @ CoreError::Fatal(_)) => {
            error!("driver exited fatally: {e}");
            Err(Box::new(e))
        }
        Err(e) => {
            error!("driver exited with error: {e}");
            Err(Box::new(e))
        }
    }
}
