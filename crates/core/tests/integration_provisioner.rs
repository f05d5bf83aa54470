//! Provisioning flows against the mock engine
//!
//! Covers phase dispatch, the lazy one-shot sidecar latch, per-build image
//! resolution caching and cleanup accounting.

mod common;

use common::{fixed_id_spec, provisioner, sidecar, SharedBuffer};
use std::collections::HashSet;
use stevedore_core::driver::mock::{MockDriver, MockRole};
use stevedore_core::errors::ProvisionError;
use stevedore_core::process::ProcStarter;
use stevedore_core::session::Phase;

#[tokio::test]
async fn test_checkout_then_build_scenario() {
    let driver = MockDriver::new();
    driver.add_image("build-tools:1");
    let mut provisioner = provisioner(&driver, fixed_id_spec("build-tools:1")).await;
    provisioner.prepare_agent().await.unwrap();

    let hello = SharedBuffer::default();
    let exit = provisioner
        .run_process(ProcStarter::new(["echo", "hello"]).stdout(hello.sink()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(exit, 0);
    assert_eq!(hello.contents(), "hello\n");

    let checkout = provisioner.session().checkout_container().unwrap().clone();
    assert_ne!(checkout.image(), "build-tools:1");

    provisioner.advance_phase();
    let world = SharedBuffer::default();
    provisioner
        .run_process(ProcStarter::new(["echo", "world"]).stdout(world.sink()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(world.contents(), "world\n");

    let work = provisioner.session().work_container().unwrap().clone();
    assert_eq!(work.image(), "build-tools:1");
    assert_ne!(work.id(), checkout.id());
    assert_eq!(provisioner.session().checkout_container(), Some(&checkout));

    provisioner.clean().await.unwrap();
    let removed: HashSet<_> = driver.targets_of("remove_container").into_iter().collect();
    assert_eq!(
        removed,
        HashSet::from([work.id().to_string(), checkout.id().to_string()])
    );
    assert!(driver.is_closed());
}

#[tokio::test]
async fn test_one_container_per_phase() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine:3.19")).await;
    provisioner.prepare_agent().await.unwrap();

    for _ in 0..3 {
        provisioner
            .run_process(ProcStarter::new(["git", "status"]))
            .await
            .unwrap();
    }
    provisioner.advance_phase();
    for _ in 0..3 {
        provisioner
            .run_process(ProcStarter::new(["make"]))
            .await
            .unwrap();
    }

    assert_eq!(driver.calls_named("launch_work_container"), 2);
    assert_eq!(driver.calls_named("exec_in_container"), 6);
}

#[tokio::test]
async fn test_advance_phase_is_idempotent() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner
        .run_process(ProcStarter::new(["true"]))
        .await
        .unwrap();
    let checkout = provisioner.session().checkout_container().cloned();
    driver.clear_calls();

    provisioner.advance_phase();
    provisioner.advance_phase();

    assert_eq!(provisioner.session().phase(), Phase::Build);
    assert_eq!(provisioner.session().checkout_container().cloned(), checkout);
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_sidecars_created_once_before_first_work_exec() {
    let driver = MockDriver::new();
    let spec = fixed_id_spec("maven:3")
        .with_sidecar(sidecar("db", "postgres:15"))
        .with_sidecar(sidecar("cache", "redis:7"));
    let mut provisioner = provisioner(&driver, spec).await;
    provisioner.prepare_agent().await.unwrap();

    provisioner
        .run_process(ProcStarter::new(["git", "clone"]))
        .await
        .unwrap();
    assert_eq!(driver.calls_named("launch_sidecar_container"), 0);

    provisioner.advance_phase();
    driver.clear_calls();
    provisioner
        .run_process(ProcStarter::new(["mvn", "verify"]))
        .await
        .unwrap();

    let operations: Vec<_> = driver
        .calls()
        .into_iter()
        .filter(|c| c.operation.starts_with("launch_") || c.operation == "exec_in_container")
        .map(|c| (c.operation, c.target))
        .collect();
    assert_eq!(operations[0], ("launch_sidecar_container".to_string(), "postgres:15".to_string()));
    assert_eq!(operations[1], ("launch_sidecar_container".to_string(), "redis:7".to_string()));
    assert_eq!(operations[2].0, "launch_work_container");
    assert_eq!(operations[3].0, "exec_in_container");

    let sidecars = provisioner.session().sidecars();
    assert_eq!(sidecars.len(), 2);
    let agent = provisioner.session().agent_container().unwrap().id().to_string();
    for handle in sidecars.values() {
        let container = driver.container(handle.id()).unwrap();
        assert_eq!(container.role, MockRole::Sidecar);
        assert_eq!(container.agent.as_deref(), Some(agent.as_str()));
    }

    driver.clear_calls();
    provisioner
        .run_process(ProcStarter::new(["mvn", "deploy"]))
        .await
        .unwrap();
    assert_eq!(driver.calls_named("launch_sidecar_container"), 0);
    assert_eq!(driver.calls_named("launch_work_container"), 0);
}

#[tokio::test]
async fn test_failed_sidecar_is_retried_without_duplicating_earlier_ones() {
    let driver = MockDriver::new();
    let spec = fixed_id_spec("maven:3")
        .with_sidecar(sidecar("db", "postgres:15"))
        .with_sidecar(sidecar("cache", "redis:7"));
    let mut provisioner = provisioner(&driver, spec).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner.advance_phase();

    driver.fail_on("pull_image");
    driver.add_image("postgres:15");
    let err = provisioner
        .run_process(ProcStarter::new(["mvn"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ImageResolutionFailed { .. }));
    assert_eq!(provisioner.session().sidecars().len(), 1);
    assert_eq!(driver.calls_named("launch_work_container"), 0);

    driver.succeed_on("pull_image");
    provisioner
        .run_process(ProcStarter::new(["mvn"]))
        .await
        .unwrap();
    assert_eq!(
        driver.targets_of("launch_sidecar_container"),
        vec!["postgres:15", "redis:7"]
    );
}

#[tokio::test]
async fn test_fixed_id_resolved_once_per_build() {
    let driver = MockDriver::new();
    let spec = fixed_id_spec("build-tools:1").with_sidecar(sidecar("tools", "build-tools:1"));
    let mut provisioner = provisioner(&driver, spec).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner.advance_phase();
    provisioner
        .run_process(ProcStarter::new(["make"]))
        .await
        .unwrap();

    assert_eq!(
        driver
            .targets_of("check_image_exists")
            .iter()
            .filter(|t| *t == "build-tools:1")
            .count(),
        1
    );
    assert_eq!(driver.targets_of("pull_image"), vec!["build-tools:1"]);
}

#[tokio::test]
async fn test_resolution_failure_precedes_creation() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("private/tools:1")).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner.advance_phase();
    driver.fail_on("pull_image");

    let err = provisioner
        .run_process(ProcStarter::new(["make"]))
        .await
        .unwrap_err();
    match err {
        ProvisionError::ImageResolutionFailed { image, .. } => assert_eq!(image, "private/tools:1"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(driver.calls_named("launch_work_container"), 0);
    assert!(provisioner.session().work_container().is_none());
}

#[tokio::test]
async fn test_failed_work_container_is_not_recorded() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner.advance_phase();
    driver.fail_on("launch_work_container");

    let err = provisioner
        .run_process(ProcStarter::new(["true"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ResourceCreationFailed { .. }));
    assert!(provisioner.session().work_container().is_none());

    provisioner.clean().await.unwrap();
    assert_eq!(driver.calls_named("remove_container"), 0);
}

#[tokio::test]
async fn test_non_zero_exit_is_a_result() {
    let driver = MockDriver::new();
    driver.update_config(|c| c.exec_exit_code = 2);
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await.unwrap();

    let exit = provisioner
        .run_process(ProcStarter::new(["false"]))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(exit, 2);
}

#[tokio::test]
async fn test_masked_arguments_never_reach_exec_history() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner
        .run_process(ProcStarter::new(["login", "-p"]).masked_arg("hunter2"))
        .await
        .unwrap();

    let history = driver.get_exec_history();
    assert_eq!(history[0].argv, vec!["login", "-p", "****"]);
}

#[tokio::test]
async fn test_environment_values_never_reach_exec_history() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await.unwrap();
    provisioner
        .run_process(ProcStarter::new(["deploy"]).env("REGISTRY_TOKEN", "t0ps3cret"))
        .await
        .unwrap();

    let history = driver.get_exec_history();
    assert_eq!(history[0].argv, vec!["env", "REGISTRY_TOKEN=****", "deploy"]);
    assert_eq!(
        history[0].envs,
        vec![("REGISTRY_TOKEN".to_string(), "t0ps3cret".to_string())]
    );
}
