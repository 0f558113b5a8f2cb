//! Explicit name registry and axis/group membership relation.
//!
//! The registry is owned by the composition root and handed to the code that
//! creates groups. Membership is kept on both sides (axis to groups, group to
//! axes) and every mutation updates both sides under one write lock, so a
//! failed operation leaves the relation untouched.

use crate::axis::{AxisFlags, AxisId, AxisNode};
use crate::error::{IcepapError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Registry-unique group identifier.
pub type GroupId = u64;

#[derive(Debug)]
struct GroupEntry {
    name: String,
    flags: AxisFlags,
    /// Members in insertion order.
    axes: Vec<AxisId>,
}

#[derive(Debug, Default)]
struct RegistryState {
    axes: HashMap<AxisId, Arc<AxisNode>>,
    axis_names: HashMap<String, AxisId>,
    axis_order: Vec<AxisId>,
    groups: HashMap<GroupId, GroupEntry>,
    group_names: HashMap<String, GroupId>,
    axis_groups: HashMap<AxisId, BTreeSet<GroupId>>,
    next_group: GroupId,
}

impl RegistryState {
    fn group(&self, id: GroupId) -> Result<&GroupEntry> {
        self.groups.get(&id).ok_or_else(|| IcepapError::UnknownName {
            kind: "group",
            name: format!("#{}", id),
        })
    }

    fn group_name(&self, id: GroupId) -> String {
        self.groups
            .get(&id)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| format!("#{}", id))
    }

    /// Mirror the combined flags of the groups of `axis` onto the node.
    fn refresh_flags(&self, axis: AxisId) {
        let Some(node) = self.axes.get(&axis) else {
            return;
        };
        let flags = self
            .axis_groups
            .get(&axis)
            .into_iter()
            .flatten()
            .filter_map(|g| self.groups.get(g))
            .fold(AxisFlags::default(), |acc, g| acc.union(g.flags));
        node.set_group_flags(flags);
    }
}

/// Shared handle to the axis and group registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Axes
    // ---------------------------------------------------------------------

    /// Register `axis` under its name.
    pub fn register_axis(&self, axis: Arc<AxisNode>) -> Result<()> {
        let mut state = self.state.write();
        if state.axis_names.contains_key(axis.name()) {
            return Err(IcepapError::DuplicateName {
                kind: "axis",
                name: axis.name().to_string(),
            });
        }
        debug!(axis = axis.name(), host = axis.host(), address = axis.address(), "axis registered");
        state.axis_names.insert(axis.name().to_string(), axis.id());
        state.axis_order.push(axis.id());
        state.axes.insert(axis.id(), axis);
        Ok(())
    }

    /// Look an axis up by name.
    pub fn axis(&self, name: &str) -> Result<Arc<AxisNode>> {
        let state = self.state.read();
        state
            .axis_names
            .get(name)
            .and_then(|id| state.axes.get(id))
            .cloned()
            .ok_or_else(|| IcepapError::UnknownName {
                kind: "axis",
                name: name.to_string(),
            })
    }

    /// Look an axis up by controller hostname and address.
    pub fn axis_at(&self, host: &str, address: u16) -> Result<Arc<AxisNode>> {
        let state = self.state.read();
        state
            .axes
            .values()
            .find(|a| a.host() == host && a.address() == address)
            .cloned()
            .ok_or_else(|| IcepapError::UnknownName {
                kind: "axis",
                name: format!("{}:{}", host, address),
            })
    }

    /// Every registered axis, in registration order.
    pub fn axes(&self) -> Vec<Arc<AxisNode>> {
        let state = self.state.read();
        state
            .axis_order
            .iter()
            .filter_map(|id| state.axes.get(id).cloned())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Groups
    // ---------------------------------------------------------------------

    /// Reserve a group name.
    pub fn create_group(&self, name: &str, flags: AxisFlags) -> Result<GroupId> {
        let mut state = self.state.write();
        if state.group_names.contains_key(name) {
            return Err(IcepapError::DuplicateName {
                kind: "group",
                name: name.to_string(),
            });
        }
        state.next_group += 1;
        let id = state.next_group;
        state.groups.insert(
            id,
            GroupEntry {
                name: name.to_string(),
                flags,
                axes: Vec::new(),
            },
        );
        state.group_names.insert(name.to_string(), id);
        debug!(group = name, %flags, "group created");
        Ok(id)
    }

    /// Look a group up by name.
    pub fn group_id(&self, name: &str) -> Result<GroupId> {
        self.state
            .read()
            .group_names
            .get(name)
            .copied()
            .ok_or_else(|| IcepapError::UnknownName {
                kind: "group",
                name: name.to_string(),
            })
    }

    /// Whether a group with this name exists.
    pub fn group_exists(&self, name: &str) -> bool {
        self.state.read().group_names.contains_key(name)
    }

    /// Group name.
    pub fn group_name(&self, group: GroupId) -> Result<String> {
        Ok(self.state.read().group(group)?.name.clone())
    }

    /// Group flags.
    pub fn group_flags(&self, group: GroupId) -> Result<AxisFlags> {
        Ok(self.state.read().group(group)?.flags)
    }

    /// Group members in insertion order.
    pub fn members(&self, group: GroupId) -> Result<Vec<Arc<AxisNode>>> {
        let state = self.state.read();
        Ok(state
            .group(group)?
            .axes
            .iter()
            .filter_map(|id| state.axes.get(id).cloned())
            .collect())
    }

    /// Whether `axis` is a member of `group`.
    pub fn is_member(&self, group: GroupId, axis: AxisId) -> bool {
        self.state
            .read()
            .axis_groups
            .get(&axis)
            .is_some_and(|groups| groups.contains(&group))
    }

    /// Names of the groups `axis` belongs to.
    pub fn groups_of(&self, axis: AxisId) -> Vec<String> {
        let state = self.state.read();
        state
            .axis_groups
            .get(&axis)
            .map(|groups| groups.iter().map(|g| state.group_name(*g)).collect())
            .unwrap_or_default()
    }

    /// Axis flags combined with the flags of every group it belongs to.
    pub fn effective_flags(&self, axis: &AxisNode) -> AxisFlags {
        axis.effective_flags()
    }

    /// Add `axis` to `group`.
    ///
    /// Fails with `ExclusivityConflict` when the axis already belongs to an
    /// exclusive group, or when `group` is exclusive and the axis already
    /// belongs to another group. Adding an existing member is a no-op.
    pub fn add_member(&self, group: GroupId, axis: &Arc<AxisNode>) -> Result<()> {
        let mut state = self.state.write();
        let target = state.group(group)?;
        let target_exclusive = target.flags.exclusive;
        if target.axes.contains(&axis.id()) {
            return Ok(());
        }

        let current: Vec<GroupId> = state
            .axis_groups
            .get(&axis.id())
            .map(|g| g.iter().copied().collect())
            .unwrap_or_default();
        let owner = current
            .iter()
            .find(|g| state.groups.get(g).is_some_and(|e| e.flags.exclusive))
            .or_else(|| if target_exclusive { current.first() } else { None });
        if let Some(owner) = owner {
            return Err(IcepapError::ExclusivityConflict {
                host: axis.host().to_string(),
                axis: axis.name().to_string(),
                group: state.group_name(*owner),
            });
        }

        if !state.axes.contains_key(&axis.id()) {
            // Groups may hold axes that were never registered by name.
            state.axes.insert(axis.id(), Arc::clone(axis));
        }
        if let Some(entry) = state.groups.get_mut(&group) {
            entry.axes.push(axis.id());
        }
        state.axis_groups.entry(axis.id()).or_default().insert(group);
        state.refresh_flags(axis.id());
        Ok(())
    }

    /// Remove `axis` from `group`.
    pub fn remove_member(&self, group: GroupId, axis: &AxisNode) -> Result<()> {
        let mut state = self.state.write();
        let name = state.group(group)?.name.clone();
        let removed = state
            .axis_groups
            .get_mut(&axis.id())
            .is_some_and(|groups| groups.remove(&group));
        if !removed {
            return Err(IcepapError::GroupMembership {
                group: name,
                axes: vec![axis.name().to_string()],
            });
        }
        if let Some(entry) = state.groups.get_mut(&group) {
            entry.axes.retain(|id| *id != axis.id());
        }
        state.refresh_flags(axis.id());
        Ok(())
    }

    /// Release every membership of `group` and its name.
    pub fn delete_group(&self, group: GroupId) -> Result<()> {
        let mut state = self.state.write();
        let Some(entry) = state.groups.remove(&group) else {
            return Err(IcepapError::UnknownName {
                kind: "group",
                name: format!("#{}", group),
            });
        };
        for id in &entry.axes {
            if let Some(groups) = state.axis_groups.get_mut(id) {
                groups.remove(&group);
            }
            state.refresh_flags(*id);
        }
        state.group_names.remove(&entry.name);
        debug!(group = %entry.name, "group deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::offline;

    fn axis(name: &str, address: u16, flags: &str) -> Arc<AxisNode> {
        let controller = offline("ice1");
        Arc::new(AxisNode::new(controller, address, Some(name), AxisFlags::parse(flags).unwrap()).unwrap())
    }

    #[tokio::test]
    async fn axis_lookup() {
        let registry = Registry::new();
        let th = axis("th", 1, "");
        registry.register_axis(Arc::clone(&th)).unwrap();

        assert_eq!(registry.axis("th").unwrap().id(), th.id());
        assert_eq!(registry.axis_at("ice1", 1).unwrap().id(), th.id());
        assert!(matches!(registry.axis("tth"), Err(IcepapError::UnknownName { .. })));
        assert!(matches!(
            registry.register_axis(axis("th", 2, "")),
            Err(IcepapError::DuplicateName { kind: "axis", .. })
        ));
    }

    #[tokio::test]
    async fn membership_is_bidirectional() {
        let registry = Registry::new();
        let th = axis("th", 1, "");
        let tth = axis("tth", 2, "");
        let g = registry.create_group("diff", AxisFlags::default()).unwrap();
        registry.add_member(g, &th).unwrap();
        registry.add_member(g, &tth).unwrap();
        registry.add_member(g, &th).unwrap();

        let names: Vec<_> = registry.members(g).unwrap().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["th", "tth"]);
        assert_eq!(registry.groups_of(th.id()), vec!["diff".to_string()]);

        registry.remove_member(g, &th).unwrap();
        assert!(!registry.is_member(g, th.id()));
        assert!(registry.remove_member(g, &th).is_err());

        registry.delete_group(g).unwrap();
        assert!(registry.groups_of(tth.id()).is_empty());
        assert!(!registry.group_exists("diff"));
        assert!(registry.create_group("diff", AxisFlags::default()).is_ok());
    }

    #[tokio::test]
    async fn exclusive_conflicts_leave_membership_unchanged() {
        let registry = Registry::new();
        let th = axis("th", 1, "");
        let g1 = registry.create_group("g1", AxisFlags::parse("mode=exclusive").unwrap()).unwrap();
        let g2 = registry.create_group("g2", AxisFlags::default()).unwrap();
        registry.add_member(g1, &th).unwrap();

        let err = registry.add_member(g2, &th).unwrap_err();
        match err {
            IcepapError::ExclusivityConflict { host, axis, group } => {
                assert_eq!(host, "ice1");
                assert_eq!(axis, "th");
                assert_eq!(group, "g1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.groups_of(th.id()), vec!["g1".to_string()]);
        assert!(registry.members(g2).unwrap().is_empty());

        // The other direction: a shared axis cannot join an exclusive group.
        let tth = axis("tth", 2, "");
        registry.add_member(g2, &tth).unwrap();
        let err = registry.add_member(g1, &tth).unwrap_err();
        assert!(matches!(err, IcepapError::ExclusivityConflict { ref group, .. } if group == "g2"));
    }

    #[tokio::test]
    async fn effective_flags_include_groups() {
        let registry = Registry::new();
        let th = axis("th", 1, "mode=readonly");
        let g = registry.create_group("g", AxisFlags::parse("mode=dontmove").unwrap()).unwrap();
        registry.add_member(g, &th).unwrap();
        let flags = registry.effective_flags(&th);
        assert!(flags.readonly && flags.dontmove && !flags.exclusive);
    }

    #[tokio::test]
    async fn group_flags_follow_membership() {
        let registry = Registry::new();
        let th = axis("th", 1, "");
        let locked = registry.create_group("locked", AxisFlags::parse("mode=dontmove").unwrap()).unwrap();
        let frozen = registry.create_group("frozen", AxisFlags::parse("mode=readonly").unwrap()).unwrap();
        registry.add_member(locked, &th).unwrap();
        registry.add_member(frozen, &th).unwrap();
        assert!(th.effective_flags().dontmove && th.effective_flags().readonly);

        registry.remove_member(frozen, &th).unwrap();
        assert!(th.effective_flags().dontmove && !th.effective_flags().readonly);

        registry.delete_group(locked).unwrap();
        assert_eq!(th.effective_flags(), AxisFlags::default());
    }
}
