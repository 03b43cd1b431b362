//! Integration tests for pod lifecycle operations.
//!
//! Pods are driven through `PodManager` directly and through
//! `Engine::execute` for the JSON-producing queries.

mod common;

use common::{TestEngine, engine, run, running_count, spec, status};
use magikpod::container::{NamespaceKind, NamespaceMode};
use magikpod::pod::PodCloneOptions;
use magikpod::{
    CloneOptions, Command, ContainerStatus, ErrorKind, EventStatus, Output, PodSpec, PodStatus,
    RemoveOptions, Signal, Targets,
};

/// Pod `name` with an infra container and running members.
async fn pod_with_members(t: &TestEngine, name: &str, members: &[&str]) -> String {
    let pod = t.pods().create(PodSpec::named(name)).unwrap();
    for member in members {
        let container = t.pods().add_member(name, spec(member, &["top"])).await.unwrap();
        t.containers().start(&container.id).await.unwrap();
    }
    pod.id
}

fn json(output: Output) -> serde_json::Value {
    match output {
        Output::Json(value) => value,
        other => panic!("expected JSON output, got {other:?}"),
    }
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_pod_with_infra() {
    let t = engine();
    let pod = t.pods().create(PodSpec::named("p1")).unwrap();

    let infra_id = pod.infra_id.clone().expect("infra container");
    let infra = t.store().get_container(&infra_id).unwrap();
    assert!(infra.is_infra);
    assert_eq!(infra.name, format!("{}-infra", pod.short_id()));
    assert_eq!(infra.status(), ContainerStatus::Created);
    assert!(pod.members.is_empty());
    assert_eq!(t.store().pod_status(&pod.id).unwrap(), PodStatus::Created);
}

#[tokio::test]
async fn test_pod_name_conflicts_with_pod() {
    let t = engine();
    t.pods().create(PodSpec::named("p1")).unwrap();
    let err = t.pods().create(PodSpec::named("p1")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
}

#[tokio::test]
async fn test_starting_member_starts_infra() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["web"]).await;
    let pod = t.store().get_pod(&pod_id).unwrap();

    let infra = pod.infra_id.unwrap();
    assert_eq!(status(&t, &infra), ContainerStatus::Running);
    assert_eq!(status(&t, "web"), ContainerStatus::Running);
    assert_eq!(t.store().pod_status(&pod_id).unwrap(), PodStatus::Running);
}

#[tokio::test]
async fn test_members_join_only_shared_namespaces() {
    let t = engine();
    t.pods()
        .create(PodSpec::named("p1").with_share([NamespaceKind::Net]))
        .unwrap();
    let member = t.pods().add_member("p1", spec("web", &["top"])).await.unwrap();

    assert_eq!(member.namespaces[&NamespaceKind::Net], NamespaceMode::Pod);
    assert_eq!(member.namespaces[&NamespaceKind::Ipc], NamespaceMode::Private);
    assert_eq!(member.namespaces[&NamespaceKind::Uts], NamespaceMode::Private);

    let doc = serde_json::to_value(t.pods().inspect(&["p1".to_string()]).unwrap()).unwrap();
    assert_eq!(doc[0]["SharedNamespaces"], serde_json::json!(["net"]));
}

// =============================================================================
// Start / Stop / Kill
// =============================================================================

#[tokio::test]
async fn test_pod_start_starts_every_container() {
    let t = engine();
    let pod = t.pods().create(PodSpec::named("p1")).unwrap();
    t.pods().add_member("p1", spec("a", &["top"])).await.unwrap();
    t.pods().add_member("p1", spec("b", &["top"])).await.unwrap();

    let report = t.pods().start("p1").await.unwrap();
    assert!(report.is_ok());
    assert_eq!(running_count(&t), 3);

    // Starting a running pod succeeds without touching it.
    let again = t.pods().start(&pod.id).await.unwrap();
    assert!(again.is_ok());
    assert_eq!(running_count(&t), 3);
}

#[tokio::test]
async fn test_pod_stop_stops_infra_last() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["a", "b"]).await;

    let report = t.pods().stop("p1", Some(1)).await.unwrap();
    assert!(report.is_ok());
    assert_eq!(running_count(&t), 0);
    assert_eq!(status(&t, "a"), ContainerStatus::Stopped);
    assert_eq!(t.store().pod_status(&pod_id).unwrap(), PodStatus::Stopped);

    let order = report.succeeded;
    let infra = t.store().get_pod(&pod_id).unwrap().infra_id.unwrap();
    assert_eq!(order.last(), Some(&infra));
}

#[tokio::test]
async fn test_pod_kill_through_engine() {
    let t = engine();
    pod_with_members(&t, "p1", &["a"]).await;
    let output = t
        .execute(Command::PodKill {
            targets: Targets::one("p1"),
            signal: "KILL".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(output.exit_code(), 0);
    assert_eq!(running_count(&t), 0);

    let a = t.store().resolve_container("a").unwrap();
    assert_eq!(a.state.exit_code, Some(137));
}

#[tokio::test]
async fn test_pod_kill_invalid_signal() {
    let t = engine();
    pod_with_members(&t, "p1", &["a"]).await;
    let err = t
        .execute(Command::PodKill {
            targets: Targets::one("p1"),
            signal: "NOPE".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSignal);
    assert_eq!(running_count(&t), 2);
}

#[tokio::test]
async fn test_pod_restart_replaces_processes() {
    let t = engine();
    pod_with_members(&t, "p1", &["a"]).await;
    let before = t.store().resolve_container("a").unwrap().state.pid;

    t.pods().restart("p1", Some(1)).await.unwrap().into_result().unwrap();
    let after = t.store().resolve_container("a").unwrap();
    assert_eq!(after.status(), ContainerStatus::Running);
    assert_ne!(after.state.pid, before);
}

// =============================================================================
// Pause / Unpause
// =============================================================================

#[tokio::test]
async fn test_pod_pause_affects_only_members() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["a", "b"]).await;
    run(&t, "outside", &["top"]).await;
    assert_eq!(running_count(&t), 4);

    t.pods().pause("p1").await.unwrap();
    assert_eq!(running_count(&t), 2);
    assert_eq!(status(&t, "a"), ContainerStatus::Paused);
    assert_eq!(status(&t, "b"), ContainerStatus::Paused);
    assert_eq!(status(&t, "outside"), ContainerStatus::Running);
    assert_eq!(t.store().pod_status(&pod_id).unwrap(), PodStatus::Paused);

    t.pods().unpause("p1").await.unwrap().into_result().unwrap();
    assert_eq!(running_count(&t), 4);
    assert_eq!(t.store().pod_status(&pod_id).unwrap(), PodStatus::Running);
}

#[tokio::test]
async fn test_pod_pause_failure_unpauses_paused_members() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["a", "b"]).await;
    let a = t.store().resolve_container("a").unwrap();
    let b = t.store().resolve_container("b").unwrap();
    t.supervisor.fail_pause(&b.id).unwrap();

    let err = t.pods().pause("p1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(status(&t, "a"), ContainerStatus::Running);
    assert_eq!(status(&t, "b"), ContainerStatus::Running);
    assert_eq!(t.store().pod_status(&pod_id).unwrap(), PodStatus::Running);

    let a_events: Vec<EventStatus> = t
        .events()
        .all()
        .into_iter()
        .filter(|e| e.id == a.id)
        .map(|e| e.status)
        .collect();
    assert!(a_events.ends_with(&[EventStatus::Pause, EventStatus::Unpause]));
    assert!(!t.events().all().iter().any(|e| e.id == pod_id && e.status == EventStatus::Pause));
}

// =============================================================================
// Remove
// =============================================================================

#[tokio::test]
async fn test_pod_remove_requires_force_for_running_members() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["a"]).await;

    let err = t.pods().remove("p1", false, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(status(&t, "a"), ContainerStatus::Running);
    assert!(t.store().get_pod(&pod_id).is_ok());

    t.pods().remove("p1", true, Some(0)).await.unwrap();
    assert!(t.store().resolve_pod("p1").is_err());
    assert!(t.store().containers().unwrap().is_empty());
}

#[tokio::test]
async fn test_pod_remove_with_stopped_members() {
    let t = engine();
    let pod = t.pods().create(PodSpec::named("p1")).unwrap();
    t.pods().add_member("p1", spec("a", &["top"])).await.unwrap();

    let removed = t.pods().remove("p1", false, None).await.unwrap();
    assert_eq!(removed, pod.id);
    assert!(t.store().resolve_container("a").is_err());
}

#[tokio::test]
async fn test_pod_remove_blocked_by_outside_dependent() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["a"]).await;
    let a = t.store().resolve_container("a").unwrap();
    let mut outside = spec("outside", &["top"]);
    outside
        .namespaces
        .set(NamespaceKind::Net, NamespaceMode::Container(a.id.clone()));
    t.containers().create(outside).unwrap();

    let err = t.pods().remove("p1", true, Some(0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("outside"));
    assert_eq!(status(&t, "a"), ContainerStatus::Running);
    assert!(t.store().get_pod(&pod_id).is_ok());
}

#[tokio::test]
async fn test_infra_container_cannot_be_removed_alone() {
    let t = engine();
    let pod = t.pods().create(PodSpec::named("p1")).unwrap();
    let infra = pod.infra_id.unwrap();

    let err = t
        .containers()
        .remove(
            &infra,
            RemoveOptions {
                force: true,
                timeout: Some(0),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(t.store().get_container(&infra).is_ok());
}

#[tokio::test]
async fn test_removing_member_leaves_pod() {
    let t = engine();
    let pod = t.pods().create(PodSpec::named("p1")).unwrap();
    let member = t.pods().add_member("p1", spec("a", &["top"])).await.unwrap();

    t.containers()
        .remove(&member.id, RemoveOptions::default())
        .await
        .unwrap();
    let pod = t.store().get_pod(&pod.id).unwrap();
    assert!(pod.members.is_empty());
    assert!(pod.infra_id.is_some());
}

// =============================================================================
// Clone
// =============================================================================

#[tokio::test]
async fn test_pod_clone_copies_members() {
    let t = engine();
    pod_with_members(&t, "p1", &["web"]).await;

    let clone = t
        .pods()
        .clone_pod("p1", PodCloneOptions::default())
        .await
        .unwrap();
    assert_eq!(clone.name, "p1-clone");
    assert!(clone.infra_id.is_some());
    assert_eq!(clone.members.len(), 1);

    let member = t.store().get_container(&clone.members[0]).unwrap();
    assert_eq!(member.name, "web-clone");
    assert_eq!(member.pod_id.as_deref(), Some(clone.id.as_str()));
    assert_eq!(member.status(), ContainerStatus::Created);
    assert_eq!(status(&t, "web"), ContainerStatus::Running);
}

#[tokio::test]
async fn test_pod_clone_start_and_destroy() {
    let t = engine();
    pod_with_members(&t, "p1", &["web"]).await;

    let clone = t
        .pods()
        .clone_pod(
            "p1",
            PodCloneOptions {
                name: Some("p2".to_string()),
                start: true,
                destroy: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(clone.name, "p2");
    assert!(t.store().resolve_pod("p1").is_err());
    assert!(t.store().resolve_container("web").is_err());
    assert_eq!(t.store().pod_status(&clone.id).unwrap(), PodStatus::Running);
}

#[tokio::test]
async fn test_pod_clone_points_name_references_at_clones() {
    let t = engine();
    t.pods().create(PodSpec::named("p1")).unwrap();
    t.pods().add_member("p1", spec("a", &["top"])).await.unwrap();
    let mut b = spec("b", &["top"]);
    b.namespaces
        .set(NamespaceKind::Uts, NamespaceMode::Container("a".to_string()));
    t.pods().add_member("p1", b).await.unwrap();

    let clone = t
        .pods()
        .clone_pod("p1", PodCloneOptions::default())
        .await
        .unwrap();
    let a_clone = t.store().resolve_container("a-clone").unwrap();
    let b_clone = t.store().resolve_container("b-clone").unwrap();
    assert_eq!(b_clone.pod_id.as_deref(), Some(clone.id.as_str()));
    assert_eq!(
        b_clone.namespaces[&NamespaceKind::Uts],
        NamespaceMode::Container(a_clone.id)
    );
}

#[tokio::test]
async fn test_clone_into_pod_with_other_share_set() {
    let t = engine();
    t.pods()
        .create(PodSpec::named("p1").with_share([NamespaceKind::Net]))
        .unwrap();
    let p2 = t
        .pods()
        .create(PodSpec::named("p2").with_share([NamespaceKind::Ipc]))
        .unwrap();
    t.pods().add_member("p1", spec("web", &["top"])).await.unwrap();

    let clone = t
        .containers()
        .clone_container(
            "web",
            CloneOptions {
                pod: Some("p2".to_string()),
                ..CloneOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(clone.pod_id.as_deref(), Some(p2.id.as_str()));
    assert_eq!(clone.namespaces[&NamespaceKind::Net], NamespaceMode::Private);
    assert_eq!(clone.namespaces[&NamespaceKind::Ipc], NamespaceMode::Pod);
    assert!(t.store().get_pod(&p2.id).unwrap().members.contains(&clone.id));
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_pod_inspect_document() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["web"]).await;

    let doc = json(
        t.execute(Command::PodInspect {
            targets: Targets::one("p1"),
        })
        .await
        .unwrap(),
    );
    assert_eq!(doc[0]["Id"], pod_id.as_str());
    assert_eq!(doc[0]["Name"], "p1");
    assert_eq!(doc[0]["State"], "Running");
    assert_eq!(doc[0]["CreateInfra"], true);
    assert_eq!(doc[0]["NumContainers"], 2);
    assert_eq!(doc[0]["Hostname"], "p1");
}

#[tokio::test]
async fn test_pod_list_filters() {
    let t = engine();
    t.pods()
        .create(PodSpec::named("blue").with_label("tier", "web"))
        .unwrap();
    t.pods()
        .create(PodSpec::named("green").with_label("tier", "db"))
        .unwrap();
    pod_with_members(&t, "red", &["r1"]).await;

    let by_label = t
        .pods()
        .list(&["label=tier=web".parse().unwrap()])
        .unwrap();
    assert_eq!(by_label.len(), 1);
    assert_eq!(by_label[0].name, "blue");

    let running = t
        .pods()
        .list(&["status=running".parse().unwrap()])
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].name, "red");
    assert_eq!(running[0].number_of_containers, 2);

    let doc = json(
        t.execute(Command::PodList {
            filters: vec!["name=green".to_string()],
        })
        .await
        .unwrap(),
    );
    assert_eq!(doc.as_array().unwrap().len(), 1);
    assert_eq!(doc[0]["Status"], "Created");

    let err = t
        .execute(Command::PodList {
            filters: vec!["ancestor=alpine".to_string()],
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
}

#[tokio::test]
async fn test_pod_top_and_stats() {
    let t = engine();
    pod_with_members(&t, "p1", &["a", "b"]).await;

    let processes = t.pods().top("p1").await.unwrap();
    assert_eq!(processes.len(), 3);
    assert!(processes.iter().any(|p| p.name == "a"));

    let stats = t.pods().stats(&["p1".to_string()], false).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "p1");
    assert_eq!(stats[0].containers.len(), 2);
}

#[tokio::test]
async fn test_pod_top_requires_running_containers() {
    let t = engine();
    t.pods().create(PodSpec::named("p1")).unwrap();
    let err = t.pods().top("p1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_member_kill_keeps_pod_running() {
    let t = engine();
    let pod_id = pod_with_members(&t, "p1", &["a", "b"]).await;
    t.containers().kill("a", Signal::Kill).await.unwrap();

    assert_eq!(status(&t, "a"), ContainerStatus::Stopped);
    assert_eq!(t.store().pod_status(&pod_id).unwrap(), PodStatus::Running);
}
