//! Composition root: controllers, axes and groups built from configuration.

use crate::axis::{AxisFlags, AxisNode};
use crate::config::{ControllerResolver, IcepapConfig};
use crate::controller::Controller;
use crate::error::{IcepapError, Result};
use crate::group::AxisGroup;
use crate::registry::Registry;
use futures::future::{join_all, try_join_all};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Every connected controller with its registered axes and groups.
#[derive(Debug)]
pub struct MotionSystem {
    controllers: BTreeMap<String, Arc<Controller>>,
    registry: Registry,
}

impl MotionSystem {
    /// Validate `config`, connect every controller concurrently, then register
    /// axes and groups.
    #[instrument(skip_all, err)]
    pub async fn connect(config: &IcepapConfig) -> Result<Self> {
        config.validate()?;

        let connected = try_join_all(config.controllers.keys().map(|name| async move {
            let endpoint = config.resolve(name)?;
            let settings = config.settings_for(name)?;
            let controller = Controller::connect(name, &endpoint, settings).await?;
            Ok::<_, IcepapError>((name.clone(), controller))
        }))
        .await?;
        let controllers: BTreeMap<String, Arc<Controller>> = connected.into_iter().collect();

        let system = Self {
            controllers,
            registry: Registry::new(),
        };
        system.build_axes(config)?;
        info!(
            controllers = system.controllers.len(),
            axes = config.axes.len(),
            groups = config.groups.len(),
            "motion system ready"
        );
        Ok(system)
    }

    fn build_axes(&self, config: &IcepapConfig) -> Result<()> {
        for axis in &config.axes {
            let controller = self.controller(&axis.controller)?;
            let flags = AxisFlags::parse(&axis.flags)?;
            let node = AxisNode::new(controller, axis.address, Some(&axis.name), flags)?;
            self.registry.register_axis(Arc::new(node))?;
        }
        for group in &config.groups {
            let axes = group
                .axes
                .iter()
                .map(|name| self.registry.axis(name))
                .collect::<Result<Vec<_>>>()?;
            AxisGroup::new(&self.registry, &group.name, &axes, &group.flags)?;
        }
        Ok(())
    }

    /// Controller by configuration name.
    pub fn controller(&self, name: &str) -> Result<Arc<Controller>> {
        self.controllers
            .get(name)
            .cloned()
            .ok_or_else(|| IcepapError::UnknownName {
                kind: "controller",
                name: name.to_string(),
            })
    }

    /// Controllers by configuration name.
    pub fn controllers(&self) -> impl Iterator<Item = (&str, &Arc<Controller>)> {
        self.controllers.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Axis by name.
    pub fn axis(&self, name: &str) -> Result<Arc<AxisNode>> {
        self.registry.axis(name)
    }

    /// Every configured axis in configuration order.
    pub fn axes(&self) -> Vec<Arc<AxisNode>> {
        self.registry.axes()
    }

    /// Group by name.
    pub fn group(&self, name: &str) -> Result<AxisGroup> {
        AxisGroup::open(&self.registry, name)
    }

    /// Detached group over the named axes, or every axis when `names` is empty.
    pub fn select(&self, names: &[String]) -> Result<AxisGroup> {
        let axes = if names.is_empty() {
            self.axes()
        } else {
            names
                .iter()
                .map(|n| self.axis(n))
                .collect::<Result<Vec<_>>>()?
        };
        Ok(AxisGroup::transient("selection", &axes))
    }

    /// Registry shared by every group of this system.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Close every controller connection.
    pub async fn close(&self) {
        join_all(self.controllers.values().map(|c| c.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AxisConfig, ControllerConfig};
    use crate::emulator::Emulator;
    use crate::protocol::ProtocolMode;
    use tracing_test::traced_test;

    fn axis(name: &str, address: u16, flags: &str) -> AxisConfig {
        AxisConfig {
            name: name.to_string(),
            controller: "ice1".to_string(),
            address,
            flags: flags.to_string(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_registers_configured_axes() {
        let emulator = Emulator::start(ProtocolMode::IcePap, &[1, 2]).await.unwrap();
        let mut config = IcepapConfig::default();
        config.controllers.insert(
            "ice1".to_string(),
            ControllerConfig {
                host: format!("127.0.0.1:{}", emulator.address().port()),
                timeout_ms: None,
                mode: ProtocolMode::IcePap,
            },
        );
        config.axes.push(axis("th", 1, ""));
        config.axes.push(axis("tth", 2, "mode=dontmove"));

        let system = MotionSystem::connect(&config).await.unwrap();
        let axes = system.axes();
        let names: Vec<&str> = axes.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["th", "tth"]);
        assert!(system.axis("tth").unwrap().flags().dontmove);
        assert!(system.controller("ice2").is_err());
        assert!(system.group("none").is_err());
        assert!(logs_contain("motion system ready"));

        let everything = system.select(&[]).unwrap();
        assert_eq!(everything.axis_names().unwrap(), vec!["th", "tth"]);

        system.close().await;
        emulator.shutdown().await;
    }
}
