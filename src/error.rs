//! Custom error types for the library.
//!
//! This module defines the primary error type, `IcepapError`, shared by every layer of
//! the crate: the transport channel, the command protocol, axes, groups and trajectories.
//! Using the `thiserror` crate, it provides a centralized and consistent way to report
//! failures with enough context to act on them.
//!
//! ## Error Hierarchy
//!
//! - **Transport**: `Connection`, `Timeout`, `ConnectionClosed`, `Io`. These mark the
//!   owning channel dirty so that the next command drains stale bytes first.
//! - **Protocol**: `Protocol`, `Checksum`, `Device`. Grammar violations, binary framing
//!   errors and failures reported by the controller firmware itself.
//! - **Domain**: `GroupMembership`, `ExclusivityConflict`, `TrajectoryState`,
//!   `Consistency`, `LengthMismatch`, `AxisProtected`, `BulkFailure`.
//! - **Setup**: `InvalidOption`, `DuplicateName`, `UnknownName`, `Config`.
//!
//! Every message carries the controller hostname, the axis and the command text
//! where they are known.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type Result<T> = std::result::Result<T, IcepapError>;

/// Lifecycle step a trajectory axis is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryStep {
    /// Axis has no column in the trajectory.
    Add,
    /// Trajectory data not yet downloaded to the controller.
    Load,
    /// Axis not yet placed on the trajectory with `sync()`.
    Sync,
}

impl std::fmt::Display for TrajectoryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TrajectoryStep::Add => "add_axis_trajectory",
            TrajectoryStep::Load => "load",
            TrajectoryStep::Sync => "sync",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for controller communication and motion coordination.
#[derive(Error, Debug)]
pub enum IcepapError {
    /// The TCP connection to a controller could not be established.
    #[error("{endpoint}: unable to connect: {source}")]
    Connection {
        /// `host:port` that was dialed
        endpoint: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// No reply arrived within the allotted time.
    #[error("{host}: timeout after {timeout:?} waiting for answer to \"{command}\"")]
    Timeout {
        /// Controller hostname
        host: String,
        /// Command text, empty for raw reads
        command: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The peer closed the connection or the channel was closed locally.
    #[error("{host}: connection closed")]
    ConnectionClosed {
        /// Controller hostname
        host: String,
    },

    /// Socket I/O failure after the connection was established.
    #[error("{host}: I/O error: {source}")]
    Io {
        /// Controller hostname
        host: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Command grammar or reply framing violation.
    #[error("{host}: protocol error on \"{command}\": {message}")]
    Protocol {
        /// Controller hostname, empty when raised before any controller was involved
        host: String,
        /// Command text
        command: String,
        /// What was wrong
        message: String,
    },

    /// Binary block checksum mismatch. Always fatal to the read.
    #[error("{host}: bad binary checksum on \"{command}\": header 0x{expected:08x}, computed 0x{computed:08x}")]
    Checksum {
        /// Controller hostname
        host: String,
        /// Command text
        command: String,
        /// Checksum announced by the header
        expected: u32,
        /// Checksum computed over the received data
        computed: u32,
    },

    /// Failure reported by the controller (`ERROR ...` answer).
    #[error("{host}: \"{command}\" failed: {message}")]
    Device {
        /// Controller hostname
        host: String,
        /// Command text
        command: String,
        /// Device-reported failure text
        message: String,
    },

    /// One or more axes are not members of the group.
    #[error("axis not in group \"{group}\": {}", axes.join(" "))]
    GroupMembership {
        /// Group name
        group: String,
        /// Offending axis names
        axes: Vec<String>,
    },

    /// An exclusive axis is already owned by another group.
    #[error("exclusive axis \"{axis}\" on \"{host}\" already used in group \"{group}\"")]
    ExclusivityConflict {
        /// Controller hostname
        host: String,
        /// Axis name
        axis: String,
        /// Group currently owning the axis
        group: String,
    },

    /// Trajectory operation issued out of lifecycle order.
    #[error("trajectory \"{trajectory}\": axis \"{axis}\" requires {missing} first")]
    TrajectoryState {
        /// Trajectory name
        trajectory: String,
        /// Axis name
        axis: String,
        /// Missing lifecycle step
        missing: TrajectoryStep,
    },

    /// Member axes disagree on a value that must be shared.
    #[error("discrepancy on {quantity} across axes: {values:?}")]
    Consistency {
        /// Quantity name, e.g. "parameter velocity"
        quantity: String,
        /// Values read back from every axis
        values: Vec<f64>,
    },

    /// Trajectory column length differs from the parameter range length.
    #[error("{column} column for axis \"{axis}\" has {actual} values, parameter range has {expected}")]
    LengthMismatch {
        /// Axis name
        axis: String,
        /// Column kind ("position" or "slope")
        column: &'static str,
        /// Parameter range length
        expected: usize,
        /// Column length
        actual: usize,
    },

    /// Trajectory operation needs at least one axis column.
    #[error("trajectory \"{0}\" has no axis")]
    EmptyTrajectory(String),

    /// Write or motion refused by an axis flag.
    #[error("axis \"{axis}\" on \"{host}\" is {flag}, refusing \"{operation}\"")]
    AxisProtected {
        /// Controller hostname
        host: String,
        /// Axis name
        axis: String,
        /// Flag that forbids the operation
        flag: &'static str,
        /// Operation attempted
        operation: String,
    },

    /// Aggregated per-axis failures of a bulk operation.
    #[error("{operation} failed on {} axis(es):\n{}", failures.len(), failures.join("\n"))]
    BulkFailure {
        /// Operation name
        operation: String,
        /// One diagnostic text per failed axis
        failures: Vec<String>,
    },

    /// Malformed `key=value` option text or invalid argument.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A name is already registered.
    #[error("{kind} name \"{name}\" already defined")]
    DuplicateName {
        /// Kind of object ("axis", "group", "trajectory axis")
        kind: &'static str,
        /// The duplicated name
        name: String,
    },

    /// A name or address could not be resolved.
    #[error("unknown {kind} \"{name}\"")]
    UnknownName {
        /// Kind of object ("axis", "group", "controller")
        kind: &'static str,
        /// The unresolved name
        name: String,
    },

    /// Configuration loading or validation failed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IcepapError {
    /// Build a protocol error for `command` on `host`.
    pub fn protocol(host: &str, command: &str, message: impl Into<String>) -> Self {
        IcepapError::Protocol {
            host: host.to_string(),
            command: command.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error leaves the transport in an unknown state.
    ///
    /// The command protocol marks the channel dirty after such an error, so
    /// the next command drains stale input first.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IcepapError::Timeout { .. }
                | IcepapError::ConnectionClosed { .. }
                | IcepapError::Io { .. }
                | IcepapError::Checksum { .. }
        )
    }
}

impl From<figment::Error> for IcepapError {
    fn from(err: figment::Error) -> Self {
        IcepapError::Config(err.to_string())
    }
}
