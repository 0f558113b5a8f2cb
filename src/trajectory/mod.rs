//! Parameter-indexed multi-axis trajectories.
//!
//! A trajectory maps a parameter range onto one position column (and an
//! optional slope column) per axis. The columns are downloaded to the
//! drivers with `*PARDAT`, the axes are placed on the path with `MOVEP` and
//! then driven along it with `PMOVE`.
//!
//! Each axis goes through [`AxisTrajectoryState`]:
//! `NotAdded -> NotLoaded -> Loaded -> Synced`. Motion and position readback
//! require `Synced`; calling them earlier fails with
//! [`IcepapError::TrajectoryState`] naming the axis and the missing step.
//!
//! # Status
//!
//! The firmware has no parameter status. [`Trajectory::status`] is derived
//! from the member axes: MOVING is set when any axis moves, READY when every
//! axis is ready. Callers deciding on motion completion should treat it as an
//! approximation.

pub mod vdata;

use crate::axis::{AxisNode, AxisStatus};
use crate::batch::{self, BatchRequest};
use crate::error::{IcepapError, Result, TrajectoryStep};
use crate::group::{All, AxisGroup, AxisMap, AxisSelector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use vdata::{ColumnKind, VectorData, PARAMETER_ADDRESS};

/// Parameter velocity used until set, in parameter units per second.
pub const DEFAULT_VELOCITY: f64 = 1.0;
/// Parameter acceleration time used until set, in seconds.
pub const DEFAULT_ACCTIME: f64 = 0.1;
/// Polling interval while waiting for the end of a trajectory motion.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one axis within a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisTrajectoryState {
    /// No column for this axis.
    NotAdded,
    /// Column defined, not downloaded.
    NotLoaded,
    /// Downloaded, axis not yet on the path.
    Loaded,
    /// Axis placed on the path; ready for `move_to`.
    Synced,
}

#[derive(Debug)]
struct AxisColumns {
    axis: Arc<AxisNode>,
    positions: Vec<f64>,
    slopes: Option<Vec<f64>>,
    loaded: bool,
    synced: bool,
}

impl AxisColumns {
    fn state(&self) -> AxisTrajectoryState {
        match (self.loaded, self.synced) {
            (false, _) => AxisTrajectoryState::NotLoaded,
            (true, false) => AxisTrajectoryState::Loaded,
            (true, true) => AxisTrajectoryState::Synced,
        }
    }
}

/// Named trajectory.
#[derive(Debug)]
pub struct Trajectory {
    name: String,
    parameter: Option<Vec<f64>>,
    columns: Vec<AxisColumns>,
    velocity: f64,
    acctime: f64,
}

impl Trajectory {
    /// Empty trajectory.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameter: None,
            columns: Vec::new(),
            velocity: DEFAULT_VELOCITY,
            acctime: DEFAULT_ACCTIME,
        }
    }

    /// Trajectory with its parameter range.
    pub fn with_parameter(name: &str, range: Vec<f64>) -> Result<Self> {
        let mut trajectory = Self::new(name);
        trajectory.set_parameter(range)?;
        Ok(trajectory)
    }

    /// Trajectory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter range, once set.
    pub fn parameter(&self) -> Option<&[f64]> {
        self.parameter.as_deref()
    }

    /// Axes with a column, in insertion order.
    pub fn axes(&self) -> Vec<Arc<AxisNode>> {
        self.columns.iter().map(|c| Arc::clone(&c.axis)).collect()
    }

    /// Position and slope columns of `axis`.
    pub fn axis_trajectory(&self, axis: &AxisNode) -> Option<(&[f64], Option<&[f64]>)> {
        self.column(axis)
            .map(|c| (c.positions.as_slice(), c.slopes.as_deref()))
    }

    /// Set the parameter range. It can be set only once until [`drain`](Self::drain).
    pub fn set_parameter(&mut self, range: Vec<f64>) -> Result<()> {
        if self.parameter.as_ref().is_some_and(|p| !p.is_empty()) {
            return Err(IcepapError::InvalidOption(format!(
                "trajectory \"{}\" already has a parameter range",
                self.name
            )));
        }
        if range.is_empty() {
            return Err(IcepapError::InvalidOption("empty parameter range".to_string()));
        }
        self.parameter = Some(range);
        Ok(())
    }

    /// Add the columns of `axis`.
    ///
    /// Without a parameter range, the range becomes `0, 1, ..., n-1`.
    /// Columns must have the parameter range length.
    pub fn add_axis_trajectory(&mut self, axis: &Arc<AxisNode>, positions: Vec<f64>, slopes: Option<Vec<f64>>) -> Result<()> {
        if self.column(axis).is_some() {
            return Err(IcepapError::DuplicateName {
                kind: "trajectory axis",
                name: axis.name().to_string(),
            });
        }
        if positions.is_empty() {
            return Err(IcepapError::InvalidOption(format!(
                "empty position column for axis \"{}\"",
                axis.name()
            )));
        }
        let expected = match &self.parameter {
            Some(range) => range.len(),
            None => positions.len(),
        };
        if positions.len() != expected {
            return Err(IcepapError::LengthMismatch {
                axis: axis.name().to_string(),
                column: "position",
                expected,
                actual: positions.len(),
            });
        }
        if let Some(slopes) = &slopes {
            if slopes.len() != expected {
                return Err(IcepapError::LengthMismatch {
                    axis: axis.name().to_string(),
                    column: "slope",
                    expected,
                    actual: slopes.len(),
                });
            }
        }
        if self.parameter.is_none() {
            self.parameter = Some((0..expected).map(|i| i as f64).collect());
        }
        debug!(trajectory = %self.name, axis = axis.name(), points = expected, "axis trajectory added");
        self.columns.push(AxisColumns {
            axis: Arc::clone(axis),
            positions,
            slopes,
            loaded: false,
            synced: false,
        });
        Ok(())
    }

    /// Lifecycle state of `axis`.
    pub fn state(&self, axis: &AxisNode) -> AxisTrajectoryState {
        self.column(axis)
            .map(AxisColumns::state)
            .unwrap_or(AxisTrajectoryState::NotAdded)
    }

    /// Forget the parameter range, every column and every load/sync flag.
    ///
    /// Firmware state is untouched until the next [`load`](Self::load).
    pub fn drain(&mut self) {
        self.parameter = None;
        self.columns.clear();
        self.velocity = DEFAULT_VELOCITY;
        self.acctime = DEFAULT_ACCTIME;
    }

    fn column(&self, axis: &AxisNode) -> Option<&AxisColumns> {
        self.columns.iter().find(|c| c.axis.id() == axis.id())
    }

    fn column_mut(&mut self, axis: &AxisNode) -> Option<&mut AxisColumns> {
        self.columns.iter_mut().find(|c| c.axis.id() == axis.id())
    }

    fn state_error(&self, axis: &AxisNode, missing: TrajectoryStep) -> IcepapError {
        IcepapError::TrajectoryState {
            trajectory: self.name.clone(),
            axis: axis.name().to_string(),
            missing,
        }
    }

    fn targets<S: AxisSelector>(&self, selector: &S) -> Result<Vec<Arc<AxisNode>>> {
        if self.columns.is_empty() {
            return Err(IcepapError::EmptyTrajectory(self.name.clone()));
        }
        match selector.explicit() {
            None => Ok(self.axes()),
            Some(axes) => {
                if let Some(stranger) = axes.iter().find(|a| self.column(a).is_none()) {
                    return Err(self.state_error(stranger, TrajectoryStep::Add));
                }
                Ok(axes)
            }
        }
    }

    fn require(&self, axes: &[Arc<AxisNode>], sync: bool) -> Result<()> {
        for axis in axes {
            match self.state(axis) {
                AxisTrajectoryState::NotAdded => return Err(self.state_error(axis, TrajectoryStep::Add)),
                AxisTrajectoryState::NotLoaded => return Err(self.state_error(axis, TrajectoryStep::Load)),
                AxisTrajectoryState::Loaded if sync => return Err(self.state_error(axis, TrajectoryStep::Sync)),
                _ => {}
            }
        }
        Ok(())
    }

    fn check_motion(axes: &[Arc<AxisNode>], operation: &str) -> Result<()> {
        for axis in axes {
            axis.effective_flags().check_motion(axis, operation)?;
        }
        Ok(())
    }

    async fn wait(&self, axes: &[Arc<AxisNode>]) -> Result<()> {
        AxisGroup::transient(&self.name, axes)
            .wait_stopped(All, WAIT_POLL_INTERVAL)
            .await
    }

    // ---------------------------------------------------------------------
    // Parameter velocity and acceleration time
    // ---------------------------------------------------------------------

    async fn shared_value(&self, verb: &str, quantity: &str) -> Result<f64> {
        let tokens = batch::query_tokens(&BatchRequest::plain(&self.axes()), verb).await?;
        let mut values = Vec::with_capacity(tokens.len());
        for (axis, token) in tokens.iter() {
            let value: f64 = token.parse().map_err(|_| {
                IcepapError::protocol(axis.host(), verb, format!("bad {} \"{}\"", quantity, token))
            })?;
            values.push(value);
        }
        match values.first() {
            Some(first) if values.iter().all(|v| v == first) => Ok(*first),
            Some(_) => Err(IcepapError::Consistency {
                quantity: quantity.to_string(),
                values,
            }),
            None => Err(IcepapError::EmptyTrajectory(self.name.clone())),
        }
    }

    async fn push_value(&self, verb: &str, value: f64, axes: &[Arc<AxisNode>]) -> Result<()> {
        if axes.is_empty() {
            return Ok(());
        }
        batch::ack_all(&BatchRequest::plain(axes), &format!("{} {:.6}", verb, value)).await?;
        Ok(())
    }

    /// Parameter velocity.
    ///
    /// With axes attached the value is read from the firmware and every axis
    /// must report the same number.
    pub async fn velocity(&self) -> Result<f64> {
        if self.columns.is_empty() {
            return Ok(self.velocity);
        }
        self.shared_value("?PARVEL", "parameter velocity").await
    }

    /// Set the parameter velocity, remembered for the next `sync`.
    #[instrument(skip(self), fields(trajectory = %self.name), err)]
    pub async fn set_velocity(&mut self, velocity: f64) -> Result<()> {
        self.velocity = velocity;
        self.push_value("PARVEL", velocity, &self.axes()).await
    }

    /// Parameter acceleration time, same rules as [`velocity`](Self::velocity).
    pub async fn acctime(&self) -> Result<f64> {
        if self.columns.is_empty() {
            return Ok(self.acctime);
        }
        self.shared_value("?PARACCT", "parameter acceleration time").await
    }

    /// Set the parameter acceleration time, remembered for the next `sync`.
    #[instrument(skip(self), fields(trajectory = %self.name), err)]
    pub async fn set_acctime(&mut self, acctime: f64) -> Result<()> {
        self.acctime = acctime;
        self.push_value("PARACCT", acctime, &self.axes()).await
    }

    // ---------------------------------------------------------------------
    // Download and motion
    // ---------------------------------------------------------------------

    /// Download the columns of the selected axes, one `*PARDAT` per controller.
    ///
    /// Each controller receives the parameter column followed by the columns
    /// of its own selected axes. Loaded axes must be synced again.
    #[instrument(skip_all, fields(trajectory = %self.name), err)]
    pub async fn load<S: AxisSelector>(&mut self, selector: S) -> Result<()> {
        let axes = self.targets(&selector)?;
        let parameter = self
            .parameter
            .clone()
            .ok_or_else(|| IcepapError::EmptyTrajectory(self.name.clone()))?;

        for command in BatchRequest::plain(&axes).build("*PARDAT")? {
            let mut data = VectorData::new();
            data.append(&parameter, PARAMETER_ADDRESS, ColumnKind::Parameter)?;
            for axis in &command.axes {
                if let Some(column) = self.column(axis) {
                    data.append(&column.positions, axis.address(), ColumnKind::Position)?;
                    if let Some(slopes) = &column.slopes {
                        data.append(slopes, axis.address(), ColumnKind::Slope)?;
                    }
                }
            }
            let block = data.to_block()?;
            debug!(
                host = command.controller.host(),
                vectors = data.columns(),
                bytes = block.as_bytes().len(),
                "downloading trajectory"
            );
            command.controller.ackcommand(&command.text, Some(&block)).await?;
            for axis in &command.axes {
                if let Some(column) = self.column_mut(axis) {
                    column.loaded = true;
                    column.synced = false;
                }
            }
        }
        info!(trajectory = %self.name, axes = axes.len(), "trajectory loaded");
        Ok(())
    }

    /// Place the selected axes on the path at `parameter` (`MOVEP`).
    ///
    /// The remembered velocity then acceleration time are pushed first. With
    /// `wait` the call returns once no target is moving.
    #[instrument(skip(self, selector), fields(trajectory = %self.name), err)]
    pub async fn sync<S: AxisSelector>(&mut self, parameter: f64, selector: S, wait: bool) -> Result<()> {
        let axes = self.targets(&selector)?;
        self.require(&axes, false)?;
        Self::check_motion(&axes, "sync")?;

        self.push_value("PARVEL", self.velocity, &axes).await?;
        self.push_value("PARACCT", self.acctime, &axes).await?;
        batch::ack_all(&BatchRequest::plain(&axes), &format!("MOVEP {:.6}", parameter)).await?;
        for axis in &axes {
            if let Some(column) = self.column_mut(axis) {
                column.synced = true;
            }
        }
        if wait {
            self.wait(&axes).await?;
        }
        Ok(())
    }

    /// Drive the selected axes along the path to `parameter` (`PMOVE`).
    #[instrument(skip(self, selector), fields(trajectory = %self.name), err)]
    pub async fn move_to<S: AxisSelector>(&self, parameter: f64, selector: S, wait: bool) -> Result<()> {
        let axes = self.targets(&selector)?;
        self.require(&axes, true)?;
        Self::check_motion(&axes, "move")?;

        batch::ack_all(&BatchRequest::plain(&axes), &format!("PMOVE {:.6}", parameter)).await?;
        if wait {
            self.wait(&axes).await?;
        }
        Ok(())
    }

    /// Stop the selected axes (acknowledged `STOP`).
    #[instrument(skip_all, fields(trajectory = %self.name), err)]
    pub async fn stop<S: AxisSelector>(&self, selector: S) -> Result<()> {
        let axes = self.targets(&selector)?;
        batch::ack_all(&BatchRequest::plain(&axes), "STOP").await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Readback
    // ---------------------------------------------------------------------

    /// Current parameter position (`?PARPOS`), as reported by the first target.
    pub async fn pos<S: AxisSelector>(&self, selector: S) -> Result<f64> {
        let axes = self.targets(&selector)?;
        self.require(&axes, true)?;
        let tokens = batch::query_tokens(&BatchRequest::plain(&axes), "?PARPOS").await?;
        let (axis, token) = tokens
            .iter()
            .next()
            .ok_or_else(|| IcepapError::EmptyTrajectory(self.name.clone()))?;
        parse_parameter(axis, token)
    }

    /// Parameter position of every selected axis.
    pub async fn axis_positions<S: AxisSelector>(&self, selector: S) -> Result<S::Output<f64>> {
        let axes = self.targets(&selector)?;
        self.require(&axes, true)?;
        let tokens = batch::query_tokens(&BatchRequest::plain(&axes), "?PARPOS").await?;
        S::collect(tokens.try_map(|axis, token| parse_parameter(axis, &token))?)
    }

    /// Derived status: MOVING if any axis moves, READY if every axis is ready.
    pub async fn status(&self) -> Result<AxisStatus> {
        let axes = self.targets(&All)?;
        let statuses: AxisMap<AxisStatus> = AxisGroup::transient(&self.name, &axes).status(All).await?;
        let moving = statuses.values().any(|s| s.is_moving());
        let ready = statuses.values().all(|s| s.is_ready());
        Ok(AxisStatus::default().with_moving(moving).with_ready(ready))
    }

    /// Whether any axis of the trajectory is moving.
    pub async fn ismoving(&self) -> Result<bool> {
        Ok(self.status().await?.is_moving())
    }
}

fn parse_parameter(axis: &AxisNode, token: &str) -> Result<f64> {
    token
        .parse()
        .map_err(|_| IcepapError::protocol(axis.host(), "?PARPOS", format!("bad parameter position \"{}\"", token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisFlags;
    use crate::controller::offline;

    fn axis(name: &str, address: u16) -> Arc<AxisNode> {
        Arc::new(AxisNode::new(offline("ice1"), address, Some(name), AxisFlags::default()).unwrap())
    }

    #[tokio::test]
    async fn default_parameter_range() {
        let a = axis("a", 1);
        let mut t = Trajectory::new("scan");
        t.add_axis_trajectory(&a, vec![5.0, 6.0, 7.0], None).unwrap();
        assert_eq!(t.parameter(), Some(&[0.0, 1.0, 2.0][..]));
        assert_eq!(t.state(&a), AxisTrajectoryState::NotLoaded);
    }

    #[tokio::test]
    async fn column_rules() {
        let a = axis("a", 1);
        let b = axis("b", 2);
        let mut t = Trajectory::with_parameter("scan", vec![0.0, 1.0, 2.0]).unwrap();
        assert!(t.set_parameter(vec![1.0]).is_err());

        let err = t.add_axis_trajectory(&a, vec![1.0, 2.0], None).unwrap_err();
        assert!(matches!(err, IcepapError::LengthMismatch { expected: 3, actual: 2, column: "position", .. }));
        let err = t
            .add_axis_trajectory(&a, vec![1.0, 2.0, 3.0], Some(vec![0.0]))
            .unwrap_err();
        assert!(matches!(err, IcepapError::LengthMismatch { column: "slope", .. }));

        t.add_axis_trajectory(&a, vec![1.0, 2.0, 3.0], None).unwrap();
        assert!(matches!(
            t.add_axis_trajectory(&a, vec![1.0, 2.0, 3.0], None),
            Err(IcepapError::DuplicateName { .. })
        ));
        assert_eq!(t.state(&b), AxisTrajectoryState::NotAdded);

        t.drain();
        assert!(t.parameter().is_none());
        assert!(t.axes().is_empty());
    }

    #[tokio::test]
    async fn move_requires_load_then_sync() {
        let a = axis("a", 1);
        let mut t = Trajectory::with_parameter("scan", vec![0.0, 1.0]).unwrap();
        assert!(matches!(
            t.move_to(1.0, All, false).await,
            Err(IcepapError::EmptyTrajectory(_))
        ));
        t.add_axis_trajectory(&a, vec![10.0, 11.0], None).unwrap();

        let err = t.move_to(1.0, All, false).await.unwrap_err();
        assert!(matches!(err, IcepapError::TrajectoryState { missing: TrajectoryStep::Load, .. }));
        let err = t.pos(&a).await.unwrap_err();
        assert!(matches!(err, IcepapError::TrajectoryState { missing: TrajectoryStep::Load, .. }));

        // Pretend the download happened.
        if let Some(column) = t.column_mut(&a) {
            column.loaded = true;
        }
        let err = t.move_to(1.0, All, false).await.unwrap_err();
        assert!(matches!(err, IcepapError::TrajectoryState { missing: TrajectoryStep::Sync, .. }));
    }

    #[tokio::test]
    async fn stranger_axis_is_rejected() {
        let a = axis("a", 1);
        let b = axis("b", 2);
        let mut t = Trajectory::new("scan");
        t.add_axis_trajectory(&a, vec![1.0], None).unwrap();
        let err = t.stop(&b).await.unwrap_err();
        assert!(matches!(err, IcepapError::TrajectoryState { missing: TrajectoryStep::Add, .. }));
    }

    #[tokio::test]
    async fn values_remembered_without_axes() {
        let mut t = Trajectory::new("scan");
        t.set_velocity(2.5).await.unwrap();
        t.set_acctime(0.3).await.unwrap();
        assert_eq!(t.velocity().await.unwrap(), 2.5);
        assert_eq!(t.acctime().await.unwrap(), 0.3);
    }
}
