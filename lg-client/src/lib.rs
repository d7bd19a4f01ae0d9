//! `lg-client`: the frame and cursor consumer pipelines, the three-task
//! scheduler that drives them against the `lgmp` transport, and the
//! external-collaborator traits a renderer/display-server/input layer
//! implements to receive decoded state.
//!
//! This crate owns no GPU, window-system, or SPICE integration — see
//! [`sink`] for the exact boundary. It does own the ambient stack a
//! runnable driver needs: configuration ([`config`]), logging
//! ([`logger`]), metrics ([`metrics`]), and error composition ([`error`]).

pub mod config;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod frame;
pub mod logger;
pub mod metrics;
pub mod sink;
pub mod state;

pub use driver::{run, DriverHandles};
pub use error::CoreError;
pub use sink::{Cap, CursorSink, DisplaySink, FrameFormat, FramePayload, FrameSink};
pub use state::{DriverState, SessionPhase, SharedState};
