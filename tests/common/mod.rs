//! Shared fixtures: emulated controllers and axes bound to them.

#![allow(dead_code)]

use icepap::controller::Controller;
use icepap::emulator::Emulator;
use icepap::protocol::{ProtocolMode, ProtocolSettings};
use icepap::{AxisFlags, AxisNode};
use std::sync::Arc;

/// One emulator with a connected controller.
pub struct Rig {
    pub emulator: Emulator,
    pub controller: Arc<Controller>,
}

impl Rig {
    /// Start an emulator with `addresses` and connect to it.
    pub async fn start(name: &str, mode: ProtocolMode, addresses: &[u16]) -> Self {
        let emulator = Emulator::start(mode, addresses)
            .await
            .expect("emulator should start");
        let settings = ProtocolSettings {
            mode,
            ..ProtocolSettings::default()
        };
        let controller = Controller::connect(name, &emulator.endpoint(), settings)
            .await
            .expect("controller should connect");
        Self { emulator, controller }
    }

    /// Axis `name` at `address` on this controller.
    pub fn axis(&self, name: &str, address: u16) -> Arc<AxisNode> {
        self.axis_with(name, address, AxisFlags::default())
    }

    /// Axis with explicit flags.
    pub fn axis_with(&self, name: &str, address: u16, flags: AxisFlags) -> Arc<AxisNode> {
        Arc::new(
            AxisNode::new(Arc::clone(&self.controller), address, Some(name), flags)
                .expect("axis should be valid"),
        )
    }

    /// Every command line the emulator received.
    pub fn commands(&self) -> Vec<String> {
        self.emulator.commands()
    }

    pub async fn shutdown(self) {
        self.controller.close().await;
        self.emulator.shutdown().await;
    }
}
