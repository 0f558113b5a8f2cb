//! Groups of axes driven with one batched command per controller.
//!
//! Every bulk accessor takes an [`AxisSelector`]:
//!
//! - [`All`] targets every member and returns an [`AxisMap`],
//! - `&Arc<AxisNode>` targets one member and returns a scalar,
//! - `&[Arc<AxisNode>]` / `&Vec<Arc<AxisNode>>` target an explicit subset and
//!   return an [`AxisMap`]. Every axis in the subset must be a member.
//!
//! ```rust,ignore
//! let group = AxisGroup::new(&registry, "slits", &[top, bottom], "")?;
//! let all = group.status(All).await?;           // AxisMap<AxisStatus>
//! let one = group.status(&top).await?;          // AxisStatus
//! ```

use crate::axis::{parse_steps, AxisFlags, AxisNode, AxisStatus};
use crate::batch::{self, BatchKind, BatchRequest};
use crate::error::{IcepapError, Result};
use crate::protocol::{BinaryBlock, Reply};
use crate::registry::{GroupId, Registry};
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default polling interval of [`AxisGroup::wait_stopped`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// AxisMap
// =============================================================================

/// Per-axis values in a stable order.
#[derive(Debug, Clone)]
pub struct AxisMap<T> {
    entries: Vec<(Arc<AxisNode>, T)>,
}

impl<T> Default for AxisMap<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> AxisMap<T> {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append or replace the value of `axis`.
    pub fn insert(&mut self, axis: Arc<AxisNode>, value: T) {
        match self.entries.iter_mut().find(|(a, _)| a.id() == axis.id()) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((axis, value)),
        }
    }

    /// Value for `axis`.
    pub fn get(&self, axis: &AxisNode) -> Option<&T> {
        self.entries
            .iter()
            .find(|(a, _)| a.id() == axis.id())
            .map(|(_, v)| v)
    }

    /// Value for the axis called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(a, _)| a.name() == name)
            .map(|(_, v)| v)
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<AxisNode>, &T)> {
        self.entries.iter().map(|(a, v)| (a, v))
    }

    /// Axes in order.
    pub fn axes(&self) -> Vec<Arc<AxisNode>> {
        self.entries.iter().map(|(a, _)| Arc::clone(a)).collect()
    }

    /// Values in order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Consume into values in order.
    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.entries.into_iter().map(|(_, v)| v)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map every value, keeping the order.
    pub fn map<U>(self, mut f: impl FnMut(&AxisNode, T) -> U) -> AxisMap<U> {
        AxisMap {
            entries: self
                .entries
                .into_iter()
                .map(|(a, v)| {
                    let u = f(&a, v);
                    (a, u)
                })
                .collect(),
        }
    }

    /// Map every value through a fallible function.
    pub fn try_map<U>(self, mut f: impl FnMut(&AxisNode, T) -> Result<U>) -> Result<AxisMap<U>> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (a, v) in self.entries {
            let u = f(&a, v)?;
            entries.push((a, u));
        }
        Ok(AxisMap { entries })
    }

    /// Sort entries to follow `order`. Axes absent from `order` go last.
    pub fn reorder(&mut self, order: &[Arc<AxisNode>]) {
        self.entries.sort_by_key(|(a, _)| {
            order
                .iter()
                .position(|o| o.id() == a.id())
                .unwrap_or(usize::MAX)
        });
    }
}

impl<T> FromIterator<(Arc<AxisNode>, T)> for AxisMap<T> {
    fn from_iter<I: IntoIterator<Item = (Arc<AxisNode>, T)>>(iter: I) -> Self {
        let mut map = AxisMap::new();
        for (axis, value) in iter {
            map.insert(axis, value);
        }
        map
    }
}

impl<T> IntoIterator for AxisMap<T> {
    type Item = (Arc<AxisNode>, T);
    type IntoIter = std::vec::IntoIter<(Arc<AxisNode>, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// =============================================================================
// Selectors
// =============================================================================

/// Target selection of a bulk accessor and the shape of its result.
pub trait AxisSelector {
    /// Result shape for per-axis values of type `T`.
    type Output<T>;

    /// Explicit axes, or `None` for every group member.
    fn explicit(&self) -> Option<Vec<Arc<AxisNode>>>;

    /// Shape per-axis results.
    fn collect<T>(results: AxisMap<T>) -> Result<Self::Output<T>>;
}

/// Every group member.
#[derive(Debug, Clone, Copy, Default)]
pub struct All;

impl AxisSelector for All {
    type Output<T> = AxisMap<T>;

    fn explicit(&self) -> Option<Vec<Arc<AxisNode>>> {
        None
    }

    fn collect<T>(results: AxisMap<T>) -> Result<Self::Output<T>> {
        Ok(results)
    }
}

impl AxisSelector for &Arc<AxisNode> {
    type Output<T> = T;

    fn explicit(&self) -> Option<Vec<Arc<AxisNode>>> {
        Some(vec![Arc::clone(*self)])
    }

    fn collect<T>(results: AxisMap<T>) -> Result<Self::Output<T>> {
        results
            .into_values()
            .next()
            .ok_or_else(|| IcepapError::InvalidOption("no result for the selected axis".to_string()))
    }
}

impl AxisSelector for &[Arc<AxisNode>] {
    type Output<T> = AxisMap<T>;

    fn explicit(&self) -> Option<Vec<Arc<AxisNode>>> {
        Some(self.to_vec())
    }

    fn collect<T>(results: AxisMap<T>) -> Result<Self::Output<T>> {
        Ok(results)
    }
}

impl AxisSelector for &Vec<Arc<AxisNode>> {
    type Output<T> = AxisMap<T>;

    fn explicit(&self) -> Option<Vec<Arc<AxisNode>>> {
        Some(self.to_vec())
    }

    fn collect<T>(results: AxisMap<T>) -> Result<Self::Output<T>> {
        Ok(results)
    }
}

// =============================================================================
// AxisGroup
// =============================================================================

#[derive(Debug, Clone)]
enum Scope {
    /// Named group whose memberships live in the registry.
    Registered { registry: Registry, id: GroupId },
    /// Detached group: no memberships, no exclusivity.
    Transient(Arc<RwLock<Vec<Arc<AxisNode>>>>),
}

/// Set of axes, possibly spread over several controllers.
#[derive(Debug, Clone)]
pub struct AxisGroup {
    name: String,
    scope: Scope,
}

impl AxisGroup {
    /// Create a registered group with `axes` and `options` flags.
    ///
    /// If any axis cannot be added the group is deleted again and the error
    /// returned; no membership survives the failure.
    pub fn new(registry: &Registry, name: &str, axes: &[Arc<AxisNode>], options: &str) -> Result<Self> {
        let flags = AxisFlags::parse(options)?;
        let id = registry.create_group(name, flags)?;
        for axis in axes {
            if let Err(err) = registry.add_member(id, axis) {
                registry.delete_group(id)?;
                return Err(err);
            }
        }
        Ok(Self {
            name: name.to_string(),
            scope: Scope::Registered {
                registry: registry.clone(),
                id,
            },
        })
    }

    /// Handle to an existing registered group.
    pub fn open(registry: &Registry, name: &str) -> Result<Self> {
        let id = registry.group_id(name)?;
        Ok(Self {
            name: name.to_string(),
            scope: Scope::Registered {
                registry: registry.clone(),
                id,
            },
        })
    }

    /// Detached group over `axes`.
    pub fn transient(name: &str, axes: &[Arc<AxisNode>]) -> Self {
        let mut unique: Vec<Arc<AxisNode>> = Vec::with_capacity(axes.len());
        for axis in axes {
            if !unique.iter().any(|a| a.id() == axis.id()) {
                unique.push(Arc::clone(axis));
            }
        }
        Self {
            name: name.to_string(),
            scope: Scope::Transient(Arc::new(RwLock::new(unique))),
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the group is detached from the registry.
    pub fn is_transient(&self) -> bool {
        matches!(self.scope, Scope::Transient(_))
    }

    /// Members in insertion order.
    pub fn members(&self) -> Result<Vec<Arc<AxisNode>>> {
        match &self.scope {
            Scope::Registered { registry, id } => registry.members(*id),
            Scope::Transient(axes) => Ok(axes.read().clone()),
        }
    }

    /// Member names in insertion order.
    pub fn axis_names(&self) -> Result<Vec<String>> {
        Ok(self.members()?.iter().map(|a| a.name().to_string()).collect())
    }

    /// Group flags; empty for transient groups.
    pub fn flags(&self) -> Result<AxisFlags> {
        match &self.scope {
            Scope::Registered { registry, id } => registry.group_flags(*id),
            Scope::Transient(_) => Ok(AxisFlags::default()),
        }
    }

    /// Flags governing writes to `axis`: its own flags OR those of every
    /// registered group it belongs to, whatever the scope of this group.
    pub fn effective_flags(&self, axis: &AxisNode) -> AxisFlags {
        axis.effective_flags()
    }

    /// Add a member.
    pub fn add_axis(&self, axis: &Arc<AxisNode>) -> Result<()> {
        match &self.scope {
            Scope::Registered { registry, id } => registry.add_member(*id, axis),
            Scope::Transient(axes) => {
                let mut axes = axes.write();
                if !axes.iter().any(|a| a.id() == axis.id()) {
                    axes.push(Arc::clone(axis));
                }
                Ok(())
            }
        }
    }

    /// Remove a member.
    pub fn remove_axis(&self, axis: &AxisNode) -> Result<()> {
        match &self.scope {
            Scope::Registered { registry, id } => registry.remove_member(*id, axis),
            Scope::Transient(axes) => {
                let mut axes = axes.write();
                let before = axes.len();
                axes.retain(|a| a.id() != axis.id());
                if axes.len() == before {
                    return Err(IcepapError::GroupMembership {
                        group: self.name.clone(),
                        axes: vec![axis.name().to_string()],
                    });
                }
                Ok(())
            }
        }
    }

    /// Release every membership and the group name.
    pub fn delete(self) -> Result<()> {
        match self.scope {
            Scope::Registered { registry, id } => registry.delete_group(id),
            Scope::Transient(_) => Ok(()),
        }
    }

    fn check_members<'a>(&self, axes: impl IntoIterator<Item = &'a Arc<AxisNode>>) -> Result<()> {
        let members = self.members()?;
        let strangers: Vec<String> = axes
            .into_iter()
            .filter(|a| !members.iter().any(|m| m.id() == a.id()))
            .map(|a| a.name().to_string())
            .collect();
        if !strangers.is_empty() {
            return Err(IcepapError::GroupMembership {
                group: self.name.clone(),
                axes: strangers,
            });
        }
        Ok(())
    }

    fn targets<S: AxisSelector>(&self, selector: &S) -> Result<Vec<Arc<AxisNode>>> {
        match selector.explicit() {
            None => self.members(),
            Some(axes) => {
                self.check_members(&axes)?;
                Ok(axes)
            }
        }
    }

    async fn query_tokens(&self, axes: &[Arc<AxisNode>], verb: &str) -> Result<AxisMap<String>> {
        if axes.is_empty() {
            return Ok(AxisMap::new());
        }
        batch::query_tokens(&BatchRequest::plain(axes), verb).await
    }

    async fn query<S, T>(&self, selector: S, verb: &str, parse: impl Fn(&str) -> Option<T>) -> Result<S::Output<T>>
    where
        S: AxisSelector,
    {
        let axes = self.targets(&selector)?;
        let tokens = self.query_tokens(&axes, verb).await?;
        let values = tokens.try_map(|axis, token| {
            parse(&token).ok_or_else(|| {
                IcepapError::protocol(
                    axis.host(),
                    verb,
                    format!("bad value \"{}\" for axis \"{}\"", token, axis.name()),
                )
            })
        })?;
        S::collect(values)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Status words (`?FSTATUS`).
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn status<S: AxisSelector>(&self, selector: S) -> Result<S::Output<AxisStatus>> {
        self.query(selector, "?FSTATUS", AxisStatus::parse_hex).await
    }

    /// Positions in steps (`?FPOS`).
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn pos<S: AxisSelector>(&self, selector: S) -> Result<S::Output<i64>> {
        self.query(selector, "?FPOS", parse_steps).await
    }

    /// Velocities in steps/s (`?VELOCITY`).
    pub async fn velocity<S: AxisSelector>(&self, selector: S) -> Result<S::Output<f64>> {
        self.query(selector, "?VELOCITY", |t: &str| t.parse::<f64>().ok()).await
    }

    /// Acceleration times in seconds (`?ACCTIME`).
    pub async fn acctime<S: AxisSelector>(&self, selector: S) -> Result<S::Output<f64>> {
        self.query(selector, "?ACCTIME", |t: &str| t.parse::<f64>().ok()).await
    }

    /// Power state (`?POWER`).
    pub async fn power<S: AxisSelector>(&self, selector: S) -> Result<S::Output<bool>> {
        self.query(selector, "?POWER", parse_power).await
    }

    /// Whether any selected axis is moving.
    pub async fn ismoving<S: AxisSelector>(&self, selector: S) -> Result<bool> {
        let axes = self.targets(&selector)?;
        let tokens = self.query_tokens(&axes, "?FSTATUS").await?;
        let mut moving = false;
        for (axis, token) in tokens.iter() {
            let status = AxisStatus::parse_hex(token).ok_or_else(|| {
                IcepapError::protocol(axis.host(), "?FSTATUS", format!("bad status word \"{}\"", token))
            })?;
            moving |= status.is_moving();
        }
        Ok(moving)
    }

    async fn per_axis<S: AxisSelector>(&self, selector: S, query: &str) -> Result<S::Output<String>> {
        let axes = self.targets(&selector)?;
        let answers = try_join_all(axes.iter().map(|axis| async move {
            let answer = axis.ackcommand(query, None).await?.into_text();
            Ok::<_, IcepapError>((Arc::clone(axis), answer))
        }))
        .await?;
        S::collect(answers.into_iter().collect())
    }

    /// Warning text of each axis (`?WARNING`).
    pub async fn warning<S: AxisSelector>(&self, selector: S) -> Result<S::Output<String>> {
        self.per_axis(selector, "?WARNING").await
    }

    /// Alarm text of each axis (`?ALARM`).
    pub async fn alarm<S: AxisSelector>(&self, selector: S) -> Result<S::Output<String>> {
        self.per_axis(selector, "?ALARM").await
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    fn check_writes(&self, values: &AxisMap<f64>, operation: &str) -> Result<()> {
        self.check_members(values.axes().iter())?;
        for (axis, _) in values.iter() {
            self.effective_flags(axis).check_write(axis, operation)?;
        }
        Ok(())
    }

    /// Redefine positions (`POS`) and return them read back.
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn set_pos(&self, positions: &AxisMap<i64>) -> Result<AxisMap<i64>> {
        let values: AxisMap<f64> = positions.iter().map(|(a, p)| (Arc::clone(a), *p as f64)).collect();
        self.check_writes(&values, "set_pos")?;
        if values.is_empty() {
            return Ok(AxisMap::new());
        }
        batch::ack_all(&BatchRequest::with_values(BatchKind::Position, values), "POS").await?;
        self.pos(&positions.axes()).await
    }

    /// Set velocities (`VELOCITY`).
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn set_velocity(&self, velocities: &AxisMap<f64>) -> Result<()> {
        self.check_writes(velocities, "set_velocity")?;
        if velocities.is_empty() {
            return Ok(());
        }
        batch::ack_all(&BatchRequest::with_values(BatchKind::Velocity, velocities.clone()), "VELOCITY").await?;
        Ok(())
    }

    /// Set acceleration times (`ACCTIME`).
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn set_acctime(&self, acctimes: &AxisMap<f64>) -> Result<()> {
        self.check_writes(acctimes, "set_acctime")?;
        if acctimes.is_empty() {
            return Ok(());
        }
        batch::ack_all(&BatchRequest::with_values(BatchKind::AccelTime, acctimes.clone()), "ACCTIME").await?;
        Ok(())
    }

    /// Switch power and verify it.
    ///
    /// Each controller must accept the request with `OK`; then the power of
    /// every target is read back. All axes that did not reach the requested
    /// state are reported together, each with its diagnostic text.
    #[instrument(skip_all, fields(group = %self.name, on = on), err)]
    pub async fn set_power<S: AxisSelector>(&self, on: bool, selector: S) -> Result<()> {
        let axes = self.targets(&selector)?;
        if axes.is_empty() {
            return Ok(());
        }
        let request = BatchRequest::plain(&axes);
        for (axis, _) in request.values.iter() {
            self.effective_flags(axis).check_write(axis, "set_power")?;
        }
        let state = if on { "ON" } else { "OFF" };
        let verb = format!("POWER {}", state);

        let refused: Vec<String> = batch::ack_all(&request, &verb)
            .await?
            .into_iter()
            .filter(|(_, answer)| answer.trim() != "OK")
            .map(|(controller, answer)| {
                format!("unable to switch power {} on system \"{}\": {}", state, controller.host(), answer)
            })
            .collect();
        if !refused.is_empty() {
            return Err(IcepapError::BulkFailure {
                operation: "set_power".to_string(),
                failures: refused,
            });
        }

        let powered = self.power(&axes).await?;
        let mut failures = Vec::new();
        for (axis, is_on) in powered.iter() {
            if *is_on != on {
                let diagnostic = axis
                    .diagnostic()
                    .await
                    .unwrap_or_else(|err| format!("diagnostic unavailable: {}\n", err));
                failures.push(format!("unable to switch power {} on {}\n{}", state, axis.info(), diagnostic));
            }
        }
        if !failures.is_empty() {
            return Err(IcepapError::BulkFailure {
                operation: "set_power".to_string(),
                failures,
            });
        }
        debug!(axes = axes.len(), state, "power switched");
        Ok(())
    }

    /// Start an absolute move of every axis in `targets` (`MOVE GROUP`).
    ///
    /// Every axis must be a member and free to move, and every position must
    /// be a finite integer step count; otherwise nothing is sent.
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn move_to(&self, targets: &AxisMap<f64>) -> Result<()> {
        self.check_members(targets.axes().iter())?;
        for (axis, _) in targets.iter() {
            self.effective_flags(axis).check_motion(axis, "move")?;
        }
        if targets.is_empty() {
            return Ok(());
        }
        batch::ack_all(&BatchRequest::with_values(BatchKind::Position, targets.clone()), "MOVE GROUP").await?;
        Ok(())
    }

    /// Stop the selected axes, without acknowledgement.
    #[instrument(skip_all, fields(group = %self.name), err)]
    pub async fn stop<S: AxisSelector>(&self, selector: S) -> Result<()> {
        let axes = self.targets(&selector)?;
        if axes.is_empty() {
            return Ok(());
        }
        batch::send_all(&BatchRequest::plain(&axes), "STOP").await
    }

    /// Block until no selected axis is moving, polling every `poll`.
    ///
    /// There is no overall deadline; cancel the future to give up.
    pub async fn wait_stopped<S: AxisSelector>(&self, selector: S, poll: Duration) -> Result<()> {
        let axes = self.targets(&selector)?;
        while self.ismoving(&axes).await? {
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pass-through
    // ---------------------------------------------------------------------

    /// Send `text` to every selected axis. A leading `#` requests acknowledgement.
    pub async fn command<S: AxisSelector>(
        &self,
        text: &str,
        payload: Option<&BinaryBlock>,
        selector: S,
    ) -> Result<S::Output<Reply>> {
        let axes = self.targets(&selector)?;
        let replies = try_join_all(axes.iter().map(|axis| async move {
            let reply = axis.command(text, payload).await?;
            Ok::<_, IcepapError>((Arc::clone(axis), reply))
        }))
        .await?;
        S::collect(replies.into_iter().collect())
    }

    /// Send `text` acknowledged to every selected axis.
    pub async fn ackcommand<S: AxisSelector>(
        &self,
        text: &str,
        payload: Option<&BinaryBlock>,
        selector: S,
    ) -> Result<S::Output<Reply>> {
        let axes = self.targets(&selector)?;
        let replies = try_join_all(axes.iter().map(|axis| async move {
            let reply = axis.ackcommand(text, payload).await?;
            Ok::<_, IcepapError>((Arc::clone(axis), reply))
        }))
        .await?;
        S::collect(replies.into_iter().collect())
    }
}

fn parse_power(token: &str) -> Option<bool> {
    match token.trim().to_uppercase().as_str() {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::offline;

    fn axis(name: &str, address: u16) -> Arc<AxisNode> {
        Arc::new(AxisNode::new(offline("ice1"), address, Some(name), AxisFlags::default()).unwrap())
    }

    #[tokio::test]
    async fn axis_map_keeps_order_and_replaces() {
        let a = axis("a", 1);
        let b = axis("b", 2);
        let mut map: AxisMap<i32> = vec![(Arc::clone(&b), 2), (Arc::clone(&a), 1)].into_iter().collect();
        map.insert(Arc::clone(&b), 20);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&b), Some(&20));
        assert_eq!(map.get_by_name("a"), Some(&1));

        map.reorder(&[Arc::clone(&a), Arc::clone(&b)]);
        assert_eq!(map.values().copied().collect::<Vec<_>>(), vec![1, 20]);
    }

    #[tokio::test]
    async fn subset_must_be_members() {
        let registry = Registry::new();
        let a = axis("a", 1);
        let b = axis("b", 2);
        let group = AxisGroup::new(&registry, "g", &[Arc::clone(&a)], "").unwrap();

        let err = group.targets(&&vec![Arc::clone(&a), Arc::clone(&b)]).unwrap_err();
        assert_eq!(err.to_string(), "axis not in group \"g\": b");

        let empty: Vec<Arc<AxisNode>> = Vec::new();
        assert!(group.targets(&&empty).unwrap().is_empty());
        assert!(group.status(&empty).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_creation_rolls_back() {
        let registry = Registry::new();
        let a = axis("a", 1);
        let _owner = AxisGroup::new(&registry, "owner", &[Arc::clone(&a)], "mode=exclusive").unwrap();

        let err = AxisGroup::new(&registry, "other", &[Arc::clone(&a)], "").unwrap_err();
        assert!(matches!(err, IcepapError::ExclusivityConflict { .. }));
        assert!(!registry.group_exists("other"));
        assert_eq!(registry.groups_of(a.id()), vec!["owner".to_string()]);
    }

    #[tokio::test]
    async fn transient_groups_ignore_exclusivity() {
        let registry = Registry::new();
        let a = axis("a", 1);
        let _owner = AxisGroup::new(&registry, "owner", &[Arc::clone(&a)], "mode=exclusive").unwrap();
        let transient = AxisGroup::transient("tmp", &[Arc::clone(&a), Arc::clone(&a)]);
        assert!(transient.is_transient());
        assert_eq!(transient.members().unwrap().len(), 1);
        transient.remove_axis(&a).unwrap();
        assert!(transient.remove_axis(&a).is_err());
    }

    #[tokio::test]
    async fn protected_axes_refuse_motion_before_sending() {
        let registry = Registry::new();
        let a = axis("a", 1);
        let group = AxisGroup::new(&registry, "g", &[Arc::clone(&a)], "mode=dontmove").unwrap();
        let targets: AxisMap<f64> = vec![(Arc::clone(&a), 10.0)].into_iter().collect();
        let err = group.move_to(&targets).await.unwrap_err();
        assert!(matches!(err, IcepapError::AxisProtected { flag: "dontmove", .. }));
        // dontmove still allows other writes
        assert!(group.check_writes(&targets, "set_velocity").is_ok());
    }

    #[test]
    fn power_tokens() {
        assert_eq!(parse_power("ON"), Some(true));
        assert_eq!(parse_power("off"), Some(false));
        assert_eq!(parse_power("?"), None);
    }
}
