//! Agent container preparation, attachment and reuse across builds

mod common;

use anyhow::Result;
use common::{fixed_id_spec, provisioner, provisioner_with, SharedBuffer};
use stevedore_core::container::ContainerHandle;
use stevedore_core::driver::mock::{MockDriver, MockRole};
use stevedore_core::errors::{ProvisionError, ResourceKind};
use stevedore_core::process::AgentChannel;
use stevedore_core::session::CarryOver;
use stevedore_core::settings::Settings;

#[tokio::test]
async fn test_fresh_build_creates_volume_then_agent() -> Result<()> {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await?;

    let session = provisioner.session();
    let volume = session.workdir_volume().expect("volume recorded");
    let agent = session.agent_container().expect("agent recorded");
    assert!(driver.has_volume_named(volume));
    assert_eq!(agent.image(), "jenkinsci/slave");
    assert_eq!(driver.container(agent.id()).unwrap().role, MockRole::Agent);
    assert_eq!(driver.calls_named("create_volume"), 1);
    assert_eq!(driver.calls_named("launch_agent_container"), 1);
    Ok(())
}

#[tokio::test]
async fn test_live_agent_from_previous_build_is_reused() -> Result<()> {
    let driver = MockDriver::new();
    driver.add_volume("vol-prev");
    driver.add_agent_container("agent-prev", "jenkinsci/slave");
    let carry_over = CarryOver {
        agent_container: Some(ContainerHandle::new("jenkinsci/slave", "agent-prev")),
        workdir_volume: Some("vol-prev".to_string()),
    };

    let mut provisioner =
        provisioner_with(&driver, fixed_id_spec("alpine"), Some(carry_over), Settings::default()).await;
    provisioner.prepare_agent().await?;

    assert_eq!(driver.calls_named("create_volume"), 0);
    assert_eq!(driver.calls_named("launch_agent_container"), 0);
    assert_eq!(
        provisioner.session().agent_container().map(|a| a.id()),
        Some("agent-prev")
    );
    Ok(())
}

#[tokio::test]
async fn test_preparing_twice_keeps_one_agent() -> Result<()> {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await?;
    let first = provisioner.session().agent_container().unwrap().clone();

    // Created but not yet attached, so the agent is not running
    assert!(!driver.container(first.id()).unwrap().running);
    provisioner.prepare_agent().await?;

    assert_eq!(driver.calls_named("create_volume"), 1);
    assert_eq!(driver.calls_named("launch_agent_container"), 1);
    assert_eq!(provisioner.session().agent_container(), Some(&first));

    provisioner.clean().await?;
    assert_eq!(driver.container_ids(), vec![first.id().to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_stopped_agent_from_previous_build_is_reused_then_discarded() -> Result<()> {
    let driver = MockDriver::new();
    driver.add_volume("vol-prev");
    driver.add_agent_container("agent-prev", "jenkinsci/slave");
    driver.stop_container("agent-prev");
    let carry_over = CarryOver {
        agent_container: Some(ContainerHandle::new("jenkinsci/slave", "agent-prev")),
        workdir_volume: Some("vol-prev".to_string()),
    };
    let mut settings = Settings::default();
    settings.agent.reuse = false;

    let mut provisioner =
        provisioner_with(&driver, fixed_id_spec("alpine"), Some(carry_over), settings).await;
    provisioner.prepare_agent().await?;
    assert_eq!(driver.calls_named("launch_agent_container"), 0);
    assert_eq!(
        provisioner.session().agent_container().map(|a| a.id()),
        Some("agent-prev")
    );

    provisioner.clean().await?;
    assert_eq!(driver.targets_of("remove_container"), vec!["agent-prev"]);
    assert!(driver.container("agent-prev").is_none());
    assert!(driver.container_ids().is_empty());
    assert!(!driver.has_volume_named("vol-prev"));
    Ok(())
}

#[tokio::test]
async fn test_vanished_agent_is_replaced_on_existing_volume() -> Result<()> {
    let driver = MockDriver::new();
    driver.add_volume("vol-prev");
    let carry_over = CarryOver {
        agent_container: Some(ContainerHandle::new("jenkinsci/slave", "agent-prev")),
        workdir_volume: Some("vol-prev".to_string()),
    };

    let mut provisioner =
        provisioner_with(&driver, fixed_id_spec("alpine"), Some(carry_over), Settings::default()).await;
    provisioner.prepare_agent().await?;

    assert_eq!(driver.calls_named("create_volume"), 0);
    assert_eq!(driver.calls_named("launch_agent_container"), 1);
    assert_eq!(provisioner.session().workdir_volume(), Some("vol-prev"));
    assert_ne!(
        provisioner.session().agent_container().map(|a| a.id()),
        Some("agent-prev")
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_agent_lookup_is_not_a_creation_failure() {
    let driver = MockDriver::new();
    driver.add_volume("vol-prev");
    driver.add_agent_container("agent-prev", "jenkinsci/slave");
    driver.fail_on("has_container");
    let carry_over = CarryOver {
        agent_container: Some(ContainerHandle::new("jenkinsci/slave", "agent-prev")),
        workdir_volume: Some("vol-prev".to_string()),
    };

    let mut provisioner =
        provisioner_with(&driver, fixed_id_spec("alpine"), Some(carry_over), Settings::default()).await;
    let err = provisioner.prepare_agent().await.unwrap_err();

    match err {
        ProvisionError::ExistenceCheckFailed { resource, target, .. } => {
            assert_eq!(resource, ResourceKind::AgentContainer);
            assert_eq!(target, "agent-prev");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(driver.calls_named("launch_agent_container"), 0);
    assert_eq!(
        provisioner.session().agent_container().map(|a| a.id()),
        Some("agent-prev")
    );
}

#[tokio::test]
async fn test_failed_volume_lookup_is_not_a_creation_failure() {
    let driver = MockDriver::new();
    driver.fail_on("has_volume");
    let carry_over = CarryOver {
        agent_container: None,
        workdir_volume: Some("vol-prev".to_string()),
    };

    let mut provisioner =
        provisioner_with(&driver, fixed_id_spec("alpine"), Some(carry_over), Settings::default()).await;
    let err = provisioner.prepare_agent().await.unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::ExistenceCheckFailed {
            resource: ResourceKind::Volume,
            ..
        }
    ));
    assert!(err.to_string().contains("vol-prev"));
    assert_eq!(driver.calls_named("create_volume"), 0);
}

#[tokio::test]
async fn test_failed_volume_creation_leaves_session_untouched() {
    let driver = MockDriver::new();
    driver.fail_on("create_volume");
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;

    let err = provisioner.prepare_agent().await.unwrap_err();
    match err {
        ProvisionError::ResourceCreationFailed { resource, .. } => {
            assert_eq!(resource, ResourceKind::Volume)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(provisioner.session().workdir_volume().is_none());
    assert!(provisioner.session().agent_container().is_none());
    assert_eq!(driver.calls_named("launch_agent_container"), 0);

    driver.succeed_on("create_volume");
    provisioner.prepare_agent().await.unwrap();
    assert_eq!(driver.calls_named("create_volume"), 2);
    assert!(provisioner.session().agent_container().is_some());
}

#[tokio::test]
async fn test_failed_agent_launch_removes_fresh_volume() {
    let driver = MockDriver::new();
    driver.fail_on("launch_agent_container");
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;

    let err = provisioner.prepare_agent().await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::ResourceCreationFailed {
            resource: ResourceKind::AgentContainer,
            ..
        }
    ));
    let created = driver.targets_of("remove_volume");
    assert_eq!(created.len(), 1);
    assert!(!driver.has_volume_named(&created[0]));
    assert!(provisioner.session().workdir_volume().is_none());
}

#[tokio::test]
async fn test_launch_agent_relays_channel_and_returns_exit_code() -> Result<()> {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await?;

    let output = SharedBuffer::default();
    let channel = AgentChannel::new(output.sink()).with_input(Box::new(&b"remoting hello\n"[..]));
    let exit = provisioner.launch_agent(channel).await?;

    assert_eq!(exit, 0);
    assert_eq!(output.contents(), "remoting hello\n");
    Ok(())
}

#[tokio::test]
async fn test_attached_agent_can_be_killed() -> Result<()> {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    provisioner.prepare_agent().await?;

    let (_controller, agent_stdin) = tokio::io::duplex(64);
    let channel = AgentChannel::new(SharedBuffer::default().sink()).with_input(Box::new(agent_stdin));
    let mut handle = provisioner.attach_agent(channel).await?;
    assert!(handle.kill());
    assert!(!handle.kill());
    assert_eq!(handle.wait().await?, 137);
    Ok(())
}

#[tokio::test]
async fn test_launch_before_prepare_is_rejected() {
    let driver = MockDriver::new();
    let mut provisioner = provisioner(&driver, fixed_id_spec("alpine")).await;
    let channel = AgentChannel::new(SharedBuffer::default().sink());
    let err = provisioner.launch_agent(channel).await.unwrap_err();
    assert!(matches!(err, ProvisionError::AgentNotPrepared));
    assert_eq!(driver.calls_named("attach_agent"), 0);
}

#[tokio::test]
async fn test_agent_survives_clean_and_serves_next_build() -> Result<()> {
    let driver = MockDriver::new();
    let mut first = provisioner(&driver, fixed_id_spec("alpine")).await;
    first.prepare_agent().await?;
    let agent_id = first.session().agent_container().unwrap().id().to_string();
    first
        .attach_agent(AgentChannel::new(SharedBuffer::default().sink()))
        .await?;
    first.clean().await?;
    let carry_over = first.into_carry_over();
    assert_eq!(
        carry_over.agent_container.as_ref().map(|a| a.id()),
        Some(agent_id.as_str())
    );

    driver.clear_calls();
    let mut second =
        provisioner_with(&driver, fixed_id_spec("alpine"), Some(carry_over), Settings::default()).await;
    second.prepare_agent().await?;

    assert_eq!(driver.calls_named("create_volume"), 0);
    assert_eq!(driver.calls_named("launch_agent_container"), 0);
    assert!(second.session().checkout_container().is_none());
    assert!(second.session().work_container().is_none());
    Ok(())
}

#[tokio::test]
async fn test_clean_discards_agent_when_reuse_disabled() -> Result<()> {
    let driver = MockDriver::new();
    let mut settings = Settings::default();
    settings.agent.reuse = false;
    let mut provisioner = provisioner_with(&driver, fixed_id_spec("alpine"), None, settings).await;
    provisioner.prepare_agent().await?;
    let agent_id = provisioner.session().agent_container().unwrap().id().to_string();
    let volume = provisioner.session().workdir_volume().unwrap().to_string();

    provisioner.clean().await?;

    assert!(driver.container(&agent_id).is_none());
    assert!(!driver.has_volume_named(&volume));
    assert_eq!(provisioner.into_carry_over(), CarryOver::default());
    Ok(())
}
