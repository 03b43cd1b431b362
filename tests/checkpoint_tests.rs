//! Integration tests for checkpoint, restore and clone.

mod common;

use common::{engine, run, running_count, spec, status};
use magikpod::{
    CheckpointOptions, CloneOptions, Command, ContainerStatus, ErrorKind, Output, PodSpec,
    RemoveOptions, RestoreOptions, Targets, constants,
};

fn keep_image(name: &str) -> CheckpointOptions {
    CheckpointOptions {
        keep: true,
        create_image: Some(name.to_string()),
        ..CheckpointOptions::default()
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

#[tokio::test]
async fn test_checkpoint_pod_member_into_image_and_restore() {
    let t = engine();
    t.pods().create(PodSpec::named("p1").without_infra()).unwrap();
    t.pods()
        .add_member("p1", spec("c1", &["top"]))
        .await
        .unwrap();
    t.containers().start("c1").await.unwrap();

    t.containers()
        .checkpoint("c1", keep_image("img1"))
        .await
        .unwrap();
    assert!(t.storage().images().exists("localhost/img1:latest"));

    let doc = serde_json::to_value(t.containers().inspect(&["c1".to_string()]).unwrap()).unwrap();
    assert_eq!(doc[0]["State"]["Checkpointed"], true);
    assert!(
        doc[0]["State"]["CheckpointPath"]
            .as_str()
            .unwrap()
            .contains("userdata/checkpoint")
    );
    assert_eq!(doc[0]["State"]["Status"], "stopped");

    t.containers()
        .remove("c1", RemoveOptions::default())
        .await
        .unwrap();
    let restored = t
        .containers()
        .restore("img1", RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(running_count(&t), 1);
    assert_eq!(restored.name, "c1");
    assert!(restored.state.restored);
    assert!(restored.pod_id.is_none());
}

#[tokio::test]
async fn test_checkpoint_image_restores_twice() {
    let t = engine();
    run(&t, "src", &["top"]).await;
    t.containers()
        .checkpoint("src", keep_image("snap"))
        .await
        .unwrap();
    t.containers()
        .remove("src", RemoveOptions::default())
        .await
        .unwrap();

    let restore_as = |name: &str| RestoreOptions {
        name: Some(name.to_string()),
        ..RestoreOptions::default()
    };
    let a = t.containers().restore("snap", restore_as("a")).await.unwrap();
    let b = t.containers().restore("snap", restore_as("b")).await.unwrap();

    assert_ne!(a.id, b.id);
    assert_ne!(a.state.pid, b.state.pid);
    assert_eq!(status(&t, "a"), ContainerStatus::Running);
    assert_eq!(status(&t, "b"), ContainerStatus::Running);
    assert!(a.state.restored && b.state.restored);

    // Stopping one leaves the other running.
    t.containers().stop("a", Some(1)).await.unwrap();
    assert_eq!(status(&t, "b"), ContainerStatus::Running);

    // Restored names stay unique.
    let err = t
        .containers()
        .restore("snap", restore_as("b"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
}

#[tokio::test]
async fn test_checkpoint_and_restore_in_place() {
    let t = engine();
    let original = run(&t, "web", &["top"]).await;

    let checkpointed = t
        .containers()
        .checkpoint("web", CheckpointOptions::default())
        .await
        .unwrap();
    assert_eq!(checkpointed.status(), ContainerStatus::Stopped);
    assert!(checkpointed.state.checkpointed);
    let userdata = t.storage().userdata(&original.id);
    assert!(userdata.join(constants::DUMP_LOG_FILE).exists());
    assert!(!userdata.join(constants::CONFIG_DUMP_FILE).exists());

    let restored = t
        .containers()
        .restore("web", RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(restored.id, original.id);
    assert_eq!(restored.status(), ContainerStatus::Running);
    assert!(restored.state.restored);
    assert!(!restored.state.checkpointed);
    assert!(!t.storage().checkpoint_dir(&original.id).exists());
    assert!(userdata.join(constants::RESTORE_LOG_FILE).exists());
}

#[tokio::test]
async fn test_restore_keep_preserves_checkpoint() {
    let t = engine();
    let original = run(&t, "web", &["top"]).await;
    t.containers()
        .checkpoint(
            "web",
            CheckpointOptions {
                keep: true,
                ..CheckpointOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(
        t.storage()
            .userdata(&original.id)
            .join(constants::CONFIG_DUMP_FILE)
            .exists()
    );

    let restored = t
        .containers()
        .restore(
            "web",
            RestoreOptions {
                keep: true,
                ..RestoreOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(restored.state.checkpointed);
    assert!(t.storage().checkpoint_dir(&original.id).exists());
}

#[tokio::test]
async fn test_checkpoint_leave_running() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    let container = t
        .containers()
        .checkpoint(
            "web",
            CheckpointOptions {
                leave_running: true,
                ..CheckpointOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(container.status(), ContainerStatus::Running);
    assert!(container.state.checkpointed);

    // Restoring needs a terminated container.
    let err = t
        .containers()
        .restore("web", RestoreOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_checkpoint_requires_running_container() {
    let t = engine();
    t.containers().create(spec("idle", &["top"])).unwrap();
    let err = t
        .containers()
        .checkpoint("idle", CheckpointOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(status(&t, "idle"), ContainerStatus::Created);
}

#[tokio::test]
async fn test_checkpoint_unsupported_runtime() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    t.supervisor.set_checkpoint_support(false);

    let err = t
        .containers()
        .checkpoint("web", CheckpointOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeUnsupported);
    assert_eq!(err.exit_code(), 125);
    assert_eq!(status(&t, "web"), ContainerStatus::Running);
}

#[tokio::test]
async fn test_invalid_image_name_rejected_before_checkpoint() {
    let t = engine();
    let container = run(&t, "web", &["top"]).await;

    let err = t
        .containers()
        .checkpoint("web", keep_image("Upper"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    assert_eq!(status(&t, "web"), ContainerStatus::Running);
    let record = t.store().get_container(&container.id).unwrap();
    assert!(!record.state.checkpointed);
    assert!(t.supervisor.live_pids().contains(&record.state.pid.unwrap()));
}

#[tokio::test]
async fn test_checkpoint_rejects_auto_remove() {
    let t = engine();
    let mut ephemeral = spec("ephemeral", &["top"]);
    ephemeral.auto_remove = true;
    t.containers().create(ephemeral).unwrap();
    t.containers().start("ephemeral").await.unwrap();

    let err = t
        .containers()
        .checkpoint("ephemeral", CheckpointOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
}

#[tokio::test]
async fn test_restore_name_requires_image() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    t.containers()
        .checkpoint("web", CheckpointOptions::default())
        .await
        .unwrap();

    let err = t
        .containers()
        .restore(
            "web",
            RestoreOptions {
                name: Some("other".to_string()),
                ..RestoreOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
}

#[tokio::test]
async fn test_restore_all_through_engine() {
    let t = engine();
    run(&t, "a", &["top"]).await;
    run(&t, "b", &["top"]).await;
    t.execute(Command::Checkpoint {
        targets: Targets {
            all: true,
            ..Targets::default()
        },
        options: CheckpointOptions::default(),
    })
    .await
    .unwrap();
    assert_eq!(running_count(&t), 0);

    let output = t
        .execute(Command::Restore {
            targets: Targets {
                all: true,
                ..Targets::default()
            },
            options: RestoreOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(output.exit_code(), 0);
    assert_eq!(running_count(&t), 2);
}

// =============================================================================
// Clone
// =============================================================================

#[tokio::test]
async fn test_clone_overrides_cpus() {
    let t = engine();
    let mut source = spec("c", &["top"]);
    source.resources.set_cpus(5.0).unwrap();
    t.containers().create(source).unwrap();

    let clone = t
        .containers()
        .clone_container(
            "c",
            CloneOptions {
                cpus: Some(4.0),
                ..CloneOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(clone.name, "c-clone");

    let doc = serde_json::to_value(
        t.containers()
            .inspect(&["c".to_string(), clone.id.clone()])
            .unwrap(),
    )
    .unwrap();
    assert_eq!(doc[0]["HostConfig"]["NanoCpus"], 5_000_000_000i64);
    assert_eq!(doc[1]["HostConfig"]["NanoCpus"], 4_000_000_000i64);
}

#[tokio::test]
async fn test_clone_is_independent_of_source() {
    let t = engine();
    let source = run(&t, "src", &["top"]).await;

    let clone = t
        .containers()
        .clone_container("src", CloneOptions::default())
        .await
        .unwrap();
    assert_eq!(clone.status(), ContainerStatus::Created);

    t.containers().start(&clone.id).await.unwrap();
    t.containers().pause(&clone.id).await.unwrap();
    t.containers()
        .remove(
            &clone.id,
            RemoveOptions {
                force: true,
                timeout: Some(0),
            },
        )
        .await
        .unwrap();

    let after = t.store().get_container(&source.id).unwrap();
    assert_eq!(after.status(), ContainerStatus::Running);
    assert_eq!(after.state.pid, source.state.pid);
}

#[tokio::test]
async fn test_clone_names_increment() {
    let t = engine();
    t.containers().create(spec("db", &["top"])).unwrap();
    let first = t
        .containers()
        .clone_container("db", CloneOptions::default())
        .await
        .unwrap();
    let second = t
        .containers()
        .clone_container("db", CloneOptions::default())
        .await
        .unwrap();
    let of_clone = t
        .containers()
        .clone_container(&first.id, CloneOptions::default())
        .await
        .unwrap();
    assert_eq!(first.name, "db-clone");
    assert_eq!(second.name, "db-clone1");
    assert_eq!(of_clone.name, "db-clone2");
}

#[tokio::test]
async fn test_clone_destroy_running_source_needs_force() {
    let t = engine();
    run(&t, "src", &["top"]).await;
    let before = t.store().containers().unwrap().len();

    let err = t
        .containers()
        .clone_container(
            "src",
            CloneOptions {
                destroy: true,
                ..CloneOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(t.store().containers().unwrap().len(), before);

    let clone = t
        .containers()
        .clone_container(
            "src",
            CloneOptions {
                destroy: true,
                force: true,
                run: true,
                ..CloneOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(t.store().resolve_container("src").is_err());
    assert_eq!(status(&t, &clone.id), ContainerStatus::Running);
}

#[tokio::test]
async fn test_clone_through_engine_prints_id() {
    let t = engine();
    t.containers().create(spec("src", &["top"])).unwrap();
    let output = t
        .execute(Command::Clone {
            source: "src".to_string(),
            options: CloneOptions {
                name: Some("copy".to_string()),
                memory: Some("32m".to_string()),
                ..CloneOptions::default()
            },
        })
        .await
        .unwrap();
    let Output::Lines(lines) = output else {
        panic!("clone must print the new ID");
    };
    let copy = t.store().resolve_container("copy").unwrap();
    assert_eq!(lines, vec![copy.id]);
    assert_eq!(copy.spec.resources.memory, 32 * 1024 * 1024);
}
