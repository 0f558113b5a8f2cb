//! Configuration-driven motion system, async frames and the `Movable` capability.

mod common;

use common::Rig;
use icepap::emulator::Emulator;
use icepap::protocol::ProtocolMode;
use icepap::{All, AsyncFrame, IcepapConfig, IcepapError, MotionSystem, Movable};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(a: &Emulator, b: &Emulator) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[application]
log_level = "debug"

[defaults]
timeout_ms = 2000

[controllers.iceA]
host = "127.0.0.1:{}"

[controllers.iceB]
host = "127.0.0.1:{}"
mode = "deep"

[[axes]]
name = "th"
controller = "iceA"
address = 1

[[axes]]
name = "tth"
controller = "iceA"
address = 2

[[axes]]
name = "chi"
controller = "iceB"
address = 5
flags = "mode=readonly"

[[groups]]
name = "diffractometer"
axes = ["th", "tth", "chi"]
flags = "mode=exclusive"
"#,
        a.address().port(),
        b.address().port()
    )
    .unwrap();
    file
}

#[tokio::test]
async fn test_system_from_config_file() {
    let a = Emulator::start(ProtocolMode::IcePap, &[1, 2]).await.unwrap();
    let b = Emulator::start(ProtocolMode::Deep, &[5]).await.unwrap();
    let file = write_config(&a, &b);

    let config = IcepapConfig::load_from(file.path()).unwrap();
    assert_eq!(config.controllers.len(), 2);
    assert_eq!(config.application.log_level, "debug");

    let system = MotionSystem::connect(&config).await.unwrap();
    assert_eq!(system.axes().len(), 3);
    for (_, controller) in system.controllers() {
        assert!(controller.is_alive().await.unwrap());
    }

    let group = system.group("diffractometer").unwrap();
    assert_eq!(group.axis_names().unwrap(), vec!["th", "tth", "chi"]);
    let positions = group.pos(All).await.unwrap();
    assert_eq!(positions.len(), 3);

    // The exclusive group owns every axis.
    let th = system.axis("th").unwrap();
    let err = icepap::AxisGroup::new(system.registry(), "other", &[th], "").unwrap_err();
    assert!(matches!(err, IcepapError::ExclusivityConflict { .. }), "{err}");

    // Selections are detached and never conflict.
    let selection = system.select(&["th".to_string(), "chi".to_string()]).unwrap();
    assert!(selection.is_transient());
    assert_eq!(selection.status(All).await.unwrap().len(), 2);

    // chi is read-only, even through a selection.
    let mut targets = icepap::AxisMap::new();
    targets.insert(system.axis("chi").unwrap(), 10.0);
    assert!(selection.move_to(&targets).await.is_err());

    assert!(matches!(
        system.axis("phi").unwrap_err(),
        IcepapError::UnknownName { kind: "axis", .. }
    ));

    system.close().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_connect_rejects_invalid_config() {
    let config = IcepapConfig::from_toml(
        r#"
[controllers.ice1]
host = "127.0.0.1:1"

[[axes]]
name = "th"
controller = "missing"
address = 1
"#,
    )
    .unwrap();
    let err = MotionSystem::connect(&config).await.unwrap_err();
    assert!(matches!(err, IcepapError::Config(_)), "{err}");
}

#[tokio::test]
async fn test_connect_failure_names_the_endpoint() {
    // Bind then drop a listener to get a port nobody answers on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = IcepapConfig::from_toml(&format!(
        "[controllers.ice1]\nhost = \"127.0.0.1:{}\"\n",
        port
    ))
    .unwrap();
    let err = MotionSystem::connect(&config).await.unwrap_err();
    match err {
        IcepapError::Connection { endpoint, .. } => assert_eq!(endpoint, format!("127.0.0.1:{}", port)),
        other => panic!("expected Connection error, got {other}"),
    }
}

#[tokio::test]
async fn test_async_frames_do_not_disturb_replies() {
    let rig = Rig::start("ice1", ProtocolMode::IcePap, &[1]).await;
    let mut frames = rig.controller.subscribe_frames();

    let frame = AsyncFrame::new(7, b"position update");
    rig.emulator.inject_frame(frame.clone());
    let axis = rig.axis("m1", 1);
    assert_eq!(axis.pos().await.unwrap(), 0);

    let received = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("frame should arrive")
        .unwrap();
    assert_eq!(received.frame_number, 7);
    assert!(received.checksum_matches());
    assert_eq!(received.payload, frame.payload);

    rig.shutdown().await;
}

#[tokio::test]
async fn test_device_errors_carry_context() {
    let rig = Rig::start("ice1", ProtocolMode::IcePap, &[1]).await;

    let err = rig.controller.command("#9:MOVE 10", None).await.unwrap_err();
    match err {
        IcepapError::Device { command, message, .. } => {
            assert_eq!(command, "#9:MOVE 10");
            assert!(message.contains("not present"), "{message}");
        }
        other => panic!("expected Device error, got {other}"),
    }

    // The connection stays usable after an error reply.
    assert!(rig.controller.is_alive().await.unwrap());
    assert!(rig.controller.protocol().is_valid_command("move 1 2").await.unwrap());
    assert!(!rig.controller.protocol().is_valid_command("FROB").await.unwrap());

    rig.shutdown().await;
}

#[tokio::test]
async fn test_deep_mode_multiline_and_help() {
    let rig = Rig::start("deep1", ProtocolMode::Deep, &[1]).await;
    let keywords = rig.controller.protocol().command_list().await.unwrap();
    assert!(keywords.iter().any(|k| k == "PARDAT"));

    let axis = rig.axis("m1", 1);
    let diagnostic = axis.diagnostic().await.unwrap();
    assert!(diagnostic.contains("WARNING: NONE"), "{diagnostic}");
    assert!(diagnostic.contains("Supply: 80V OK"), "{diagnostic}");

    rig.shutdown().await;
}

#[tokio::test]
async fn test_axis_as_movable() {
    let rig = Rig::start("ice1", ProtocolMode::IcePap, &[1]).await;
    rig.emulator.set_motion_polls(1);
    let axis = rig.axis("m1", 1);
    let stage: &dyn Movable = &*axis;

    stage.move_abs(250.0).await.unwrap();
    stage.wait_settled().await.unwrap();
    assert_eq!(stage.position().await.unwrap(), 250.0);

    stage.move_rel(-50.0).await.unwrap();
    stage.wait_settled().await.unwrap();
    assert_eq!(stage.position().await.unwrap(), 200.0);

    stage.stop().await.unwrap();
    assert_eq!(rig.emulator.axis(1).unwrap().position, 200);

    rig.shutdown().await;
}
