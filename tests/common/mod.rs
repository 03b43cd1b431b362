//! Shared fixtures for the integration tests.
//!
//! Every test gets its own storage root and an in-process supervisor, so
//! tests run in parallel without root privileges or an OCI runtime.

#![allow(dead_code)]

use magikpod::bundle::{LayerFile, pack_files};
use magikpod::{
    Container, ContainerSpec, ContainerStatus, Engine, EngineConfig, ImageConfig,
    SimulatedSupervisor,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Image every test container is created from.
pub const ALPINE: &str = "alpine";

/// Engine, supervisor and the directory backing them.
pub struct TestEngine {
    pub engine: Engine,
    pub supervisor: Arc<SimulatedSupervisor>,
    pub temp: TempDir,
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

/// Engine with a fresh root and the `alpine` test image imported.
pub fn engine() -> TestEngine {
    let temp = TempDir::new().expect("temp dir");
    let supervisor = Arc::new(SimulatedSupervisor::new());
    let engine = open(&temp, &supervisor);
    import_alpine(&engine);
    TestEngine {
        engine,
        supervisor,
        temp,
    }
}

/// Opens an engine on an existing root.
pub fn open(temp: &TempDir, supervisor: &Arc<SimulatedSupervisor>) -> Engine {
    let config = EngineConfig::with_root(temp.path());
    Engine::with_supervisor(config, supervisor.clone()).expect("engine")
}

fn import_alpine(engine: &Engine) {
    let mut files: Vec<LayerFile> = ["top", "sh", "echo", "sleep", "true", "false"]
        .iter()
        .map(|name| LayerFile::executable(format!("bin/{name}"), b"#!/bin/sh\n".to_vec()))
        .collect();
    files.push(LayerFile::regular("bin/plain", b"not a program".to_vec()));
    files.push(LayerFile::regular("etc/os-release", b"ID=alpine\n".to_vec()));
    let layer = pack_files(&files).expect("layer");

    let config = ImageConfig {
        cmd: vec!["/bin/sh".to_string()],
        env: vec!["PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
        ..ImageConfig::default()
    };
    engine
        .storage()
        .images()
        .import(ALPINE, &[layer], config, BTreeMap::new())
        .expect("import alpine");
}

/// Spec for a named container running `command`.
pub fn spec(name: &str, command: &[&str]) -> ContainerSpec {
    ContainerSpec::new(ALPINE)
        .with_name(name)
        .with_command(command.iter().copied())
}

/// Creates and starts a container.
pub async fn run(engine: &Engine, name: &str, command: &[&str]) -> Container {
    let container = engine.containers().create(spec(name, command)).expect("create");
    engine.containers().start(&container.id).await.expect("start")
}

/// Current status of a container.
pub fn status(engine: &Engine, reference: &str) -> ContainerStatus {
    engine
        .store()
        .resolve_container(reference)
        .expect("container")
        .status()
}

/// Number of running containers in the whole engine, infra included.
pub fn running_count(engine: &Engine) -> usize {
    engine
        .store()
        .containers()
        .expect("containers")
        .iter()
        .filter(|c| c.status() == ContainerStatus::Running)
        .count()
}
