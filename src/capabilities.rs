//! Motion capability consumed by scheduling layers.
//!
//! A scan engine drives single axes through [`Movable`] without knowing the
//! wire protocol:
//!
//! ```rust,ignore
//! async fn step(stage: &dyn Movable, target: f64) -> Result<f64> {
//!     stage.move_abs(target).await?;
//!     stage.wait_settled().await?;
//!     stage.position().await
//! }
//! ```

use crate::axis::AxisNode;
use crate::error::{IcepapError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Polling interval of [`Movable::wait_settled`] on an [`AxisNode`].
pub const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capability: Motion Control
///
/// Devices that can move to positions (stages, rotation mounts, axes).
///
/// # Contract
/// - Positions are in device-native units (motor steps for IcePAP axes)
/// - `move_abs` and `move_rel` initiate motion and return before completion
/// - `wait_settled` blocks until motion completes
/// - `position` may be approximate while moving
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    ///
    /// # Arguments
    /// * `position` - Target position in device-native units
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    /// Get current position
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    ///
    /// Polls until the device reports motion complete. There is no overall
    /// deadline; drop the future to give up.
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    async fn stop(&self) -> Result<()>;
}

fn to_steps(axis: &AxisNode, position: f64) -> Result<i64> {
    if !position.is_finite() || position < i64::MIN as f64 || position > i64::MAX as f64 {
        return Err(IcepapError::InvalidOption(format!(
            "position {} for axis \"{}\" is not an integer",
            position,
            axis.name()
        )));
    }
    Ok(position.trunc() as i64)
}

#[async_trait]
impl Movable for AxisNode {
    async fn move_abs(&self, position: f64) -> Result<()> {
        let steps = to_steps(self, position)?;
        self.move_to(steps).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.pos().await? as f64)
    }

    async fn wait_settled(&self) -> Result<()> {
        while self.status().await?.is_moving() {
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        AxisNode::stop(self).await
    }
}
