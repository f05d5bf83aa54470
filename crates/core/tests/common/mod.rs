//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use stevedore_core::driver::mock::MockDriver;
use stevedore_core::process::OutputSink;
use stevedore_core::provisioner::Provisioner;
use stevedore_core::session::{CarryOver, SessionState};
use stevedore_core::settings::Settings;
use stevedore_core::spec::{ContainerSetSpec, ContainerSpec, ImageSpec, SidecarSpec};
use tokio::io::AsyncWrite;

/// Output sink whose contents stay readable after it is handed away
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn sink(&self) -> OutputSink {
        Box::new(self.clone())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Work image by fixed id, no sidecars
pub fn fixed_id_spec(image: &str) -> ContainerSetSpec {
    ContainerSetSpec::new(ContainerSpec::new(ImageSpec::image_id(image)))
}

pub fn sidecar(name: &str, image: &str) -> SidecarSpec {
    SidecarSpec::new(name, ContainerSpec::new(ImageSpec::image_id(image)))
}

pub async fn provisioner_with(
    driver: &MockDriver,
    spec: ContainerSetSpec,
    carry_over: Option<CarryOver>,
    settings: Settings,
) -> Provisioner<MockDriver> {
    Provisioner::new(driver.clone(), spec, SessionState::new(carry_over), settings)
        .await
        .expect("mock engine should be reachable")
}

pub async fn provisioner(driver: &MockDriver, spec: ContainerSetSpec) -> Provisioner<MockDriver> {
    provisioner_with(driver, spec, None, Settings::default()).await
}
