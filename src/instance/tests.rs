//! Unit tests for the stage machine and teardown.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::container::{ContainerError, Endpoint};
use crate::test_support::{ScriptedDriver, ScriptedRunner, fake_keygen};
use rstest::rstest;

fn orchestrator(driver: &ScriptedDriver, runner: &ScriptedRunner) -> Orchestrator {
    Orchestrator::new(Arc::new(driver.clone()), Arc::new(runner.clone()))
}

fn container_only() -> Config {
    Config {
        container_only: true,
        ..Config::default()
    }
}

#[rstest]
#[case(Stage::Uninitialized, Stage::KeyReady)]
#[case(Stage::KeyReady, Stage::ContainerReady)]
#[case(Stage::ContainerReady, Stage::ContainerOnly)]
#[case(Stage::ContainerOnly, Stage::AccountReady)]
#[case(Stage::AccountReady, Stage::SessionReady)]
#[case(Stage::SessionReady, Stage::WorkingCopyReady)]
fn stages_are_ordered(#[case] earlier: Stage, #[case] later: Stage) {
    assert!(earlier < later);
}

#[tokio::test]
async fn container_only_stops_after_container() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000));
    let runner = ScriptedRunner::new();
    fake_keygen(&runner);

    let mut instance = orchestrator(&driver, &runner)
        .create(container_only())
        .await
        .unwrap_or_else(|failure| panic!("create: {}", failure.error));

    assert_eq!(instance.stage(), Stage::ContainerOnly);
    let handle = instance
        .container()
        .unwrap_or_else(|| panic!("container should be populated"));
    assert_eq!(handle.http, Endpoint::new("localhost", 41000));
    assert!(instance.http().is_none());
    assert!(instance.ssh().is_none());
    assert!(instance.working_copy().is_none());
    assert!(instance.config().cleanup.owns(Resource::Container));
    assert!(instance.config().cleanup.owns(Resource::PrivateKey));

    instance
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    assert_eq!(driver.terminations(), 1);
}

#[tokio::test]
async fn destroy_twice_removes_once() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000));
    let runner = ScriptedRunner::new();
    fake_keygen(&runner);
    let mut instance = orchestrator(&driver, &runner)
        .create(container_only())
        .await
        .unwrap_or_else(|failure| panic!("create: {}", failure.error));
    let key = instance
        .config()
        .private_key_path
        .clone()
        .unwrap_or_else(|| panic!("generated key path"));
    assert!(key.exists());

    instance
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    instance
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("second destroy: {err}"));

    assert_eq!(driver.terminations(), 1);
    assert!(!key.exists());
    assert!(!crate::keys::public_key_path(&key).exists());
    assert_eq!(instance.config().cleanup.owned().count(), 0);
}

#[tokio::test]
async fn teardown_failures_are_collected_and_teardown_continues() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000)).failing_terminate();
    let runner = ScriptedRunner::new();
    fake_keygen(&runner);
    let mut instance = orchestrator(&driver, &runner)
        .create(container_only())
        .await
        .unwrap_or_else(|failure| panic!("create: {}", failure.error));
    let key = instance
        .config()
        .private_key_path
        .clone()
        .unwrap_or_else(|| panic!("generated key path"));

    let err = instance
        .destroy()
        .await
        .expect_err("terminate failure should be reported");

    assert_eq!(err.failures.len(), 1);
    assert_eq!(
        err.failures.first().map(|failure| failure.resource),
        Some(Resource::Container)
    );
    assert!(err.to_string().starts_with("teardown failed: container:"));
    assert!(!key.exists(), "key removal should still run");
    assert_eq!(instance.destroy().await, Ok(()));
}

#[tokio::test]
async fn start_failure_returns_partial_instance() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000)).failing_start();
    let runner = ScriptedRunner::new();
    fake_keygen(&runner);

    let failure = orchestrator(&driver, &runner)
        .create(Config::default())
        .await
        .expect_err("start failure should abort create");
    let (error, mut instance) = failure.into_parts();

    assert!(matches!(error, ProvisionError::Container(ContainerError::Runtime(_))));
    assert_eq!(error.stage(), Some(Stage::ContainerReady));
    assert_eq!(instance.stage(), Stage::KeyReady);
    assert!(instance.config().cleanup.owns(Resource::Container));
    assert!(
        instance
            .container_id()
            .is_some_and(|name| name.starts_with("gerrit-fixture-")),
        "launch attempt should be recorded by name"
    );
    instance
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    assert_eq!(driver.terminations(), 1);
    assert!(instance.container_id().is_none());
}

#[tokio::test]
async fn deadline_during_port_resolution_still_removes_container() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000))
        .stalling_ports(Duration::from_secs(5));
    let runner = ScriptedRunner::new();
    fake_keygen(&runner);
    let config = Config {
        timeout_secs: 1,
        ..container_only()
    };

    let failure = orchestrator(&driver, &runner)
        .create(config)
        .await
        .expect_err("stalled port lookup should hit the deadline");
    let (error, mut instance) = failure.into_parts();

    assert_eq!(error, ProvisionError::TimedOut { seconds: 1 });
    assert!(instance.container().is_none());
    assert_eq!(instance.container_id(), Some("scripted-1"));
    assert!(instance.config().cleanup.owns(Resource::Container));
    assert_eq!(driver.running(), 1);

    instance
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    assert_eq!(driver.terminations(), 1);
    assert_eq!(driver.running(), 0);
}

#[tokio::test]
async fn cancellation_during_port_resolution_still_removes_container() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000))
        .stalling_ports(Duration::from_secs(5));
    let runner = ScriptedRunner::new();
    fake_keygen(&runner);

    let failure = orchestrator(&driver, &runner)
        .create_with_cancel(container_only(), tokio::time::sleep(Duration::from_millis(300)))
        .await
        .expect_err("cancelled provisioning should fail");
    let (error, mut instance) = failure.into_parts();

    assert_eq!(error, ProvisionError::Cancelled);
    assert_eq!(driver.running(), 1);
    instance
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    assert_eq!(driver.running(), 0);
}

#[tokio::test]
async fn invalid_config_fails_before_any_io() {
    let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000));
    let runner = ScriptedRunner::new();
    let config = Config {
        image: String::new(),
        ..Config::default()
    };

    let failure = orchestrator(&driver, &runner)
        .create(config)
        .await
        .expect_err("blank image should be rejected");

    assert!(failure.error.is_configuration());
    assert_eq!(failure.instance.stage(), Stage::Uninitialized);
    assert!(runner.invocations().is_empty());
    assert_eq!(driver.starts(), 0);
}
