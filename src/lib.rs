//! # IcePAP / DEEP Controller Library
//!
//! Client side of the IcePAP stepper-motor controller protocol and of the DEEP
//! device protocol it shares its framing with. The crate talks to controllers
//! over TCP, coordinates axes spread over several controllers, and drives
//! parametric trajectories.
//!
//! ## Crate Structure
//!
//! - **`transport`**: TCP channel to one controller. A background receiver task
//!   separates synchronous reply bytes from unsolicited async frames.
//! - **`protocol`**: Command grammar, binary block encoding and the
//!   request/reply engine (`CommandProtocol`).
//! - **`controller`**: Named controller handle wrapping one protocol engine.
//! - **`axis`**: Single axis node: status word decoding, flags, moves.
//! - **`registry`**: Axis and group bookkeeping, exclusivity rules.
//! - **`batch`**: Per-controller batching of multi-axis commands.
//! - **`group`**: Axis groups and the `AxisMap` result container.
//! - **`trajectory`**: Parametric trajectories and the vector-data codec.
//! - **`capabilities`**: `Movable` trait for generic motion code.
//! - **`config`**: Figment-based configuration (TOML file + `ICEPAP_` env).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`system`**: Composition root connecting controllers from configuration.
//! - **`emulator`**: Loopback controller emulator for tests and demos.
//! - **`error`**: The `IcepapError` enum used across the crate.

pub mod axis;
pub mod batch;
pub mod capabilities;
pub mod config;
pub mod controller;
pub mod emulator;
pub mod error;
pub mod group;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod system;
pub mod trajectory;
pub mod transport;

pub use axis::{AxisFlags, AxisNode, AxisStatus};
pub use capabilities::Movable;
pub use config::IcepapConfig;
pub use controller::Controller;
pub use error::{IcepapError, Result};
pub use group::{All, AxisGroup, AxisMap, AxisSelector};
pub use protocol::{ProtocolMode, Reply};
pub use registry::Registry;
pub use system::MotionSystem;
pub use trajectory::Trajectory;
pub use transport::{AsyncFrame, Endpoint};
