//! `relume-runtime` – the two polling loops.
//!
//! # Modules
//!
//! - [`host`] – [`HostLoop`][host::HostLoop]: every 100 ms takes the newest
//!   camera frame, runs [`HostPipeline::decide`][host::HostPipeline::decide]
//!   (preprocess, detect, plan, follow) on a blocking worker and sends a
//!   sequenced [`Command`][relume_types::Command] to the controller.
//! - [`controller`] – [`ControllerLoop`][controller::ControllerLoop]: every
//!   10 ms drains host commands, closes the per-wheel PID loops, integrates
//!   the fused pose and reports telemetry.  Engages a failsafe stop when the
//!   host goes quiet.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: tick-driven heartbeat
//!   monitor used by both loops.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.
//!
//! Both loops are built around a synchronous core (`step` / `decide`) so the
//! control logic is testable without a runtime; the async `run` methods only
//! add timing and link I/O.

pub mod controller;
pub mod host;
pub mod telemetry;
pub mod watchdog;

pub use controller::{ControllerConfig, ControllerLoop};
pub use host::{Decision, FrameSlot, HostConfig, HostLoop, HostPipeline, Outcome, Pursuit};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use watchdog::{ComponentHealth, Watchdog};
