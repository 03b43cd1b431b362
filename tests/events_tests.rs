//! Integration tests for the event log.
//!
//! Covers time bounds, filter combination, rendering and persistence of
//! the events recorded by container operations.

mod common;

use common::{engine, open, run};
use magikpod::{Command, ContainerStatus, Event, EventQuery, EventStatus, EventType, Output};
use std::time::{Duration, Instant};

async fn events(t: &common::TestEngine, filters: &[&str], until: Option<&str>) -> Vec<String> {
    let output = t
        .execute(Command::Events {
            since: None,
            until: until.map(str::to_string),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            format: Some("json".to_string()),
            stream: false,
        })
        .await
        .unwrap();
    match output {
        Output::Lines(lines) => lines,
        other => panic!("events must print lines, got {other:?}"),
    }
}

fn parse(lines: &[String]) -> Vec<Event> {
    lines
        .iter()
        .map(|l| serde_json::from_str(l).expect("JSON event line"))
        .collect()
}

// =============================================================================
// Time Bounds
// =============================================================================

#[tokio::test]
async fn test_until_in_future_waits_for_new_events() {
    let t = engine();
    let started = Instant::now();

    let late = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        run(&t, "late", &["top"]).await;
    };
    let (lines, ()) = tokio::join!(events(&t, &["event=start"], Some("1s")), late);

    assert!(started.elapsed() >= Duration::from_millis(500));
    let collected = parse(&lines);
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].name, "late");
    assert_eq!(collected[0].status, EventStatus::Start);
}

#[tokio::test]
async fn test_bounded_query_returns_immediately() {
    let t = engine();
    run(&t, "web", &["top"]).await;

    let started = Instant::now();
    let lines = events(&t, &["type=container"], None).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let statuses: Vec<EventStatus> = parse(&lines).iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![EventStatus::Create, EventStatus::Init, EventStatus::Start]
    );
}

#[tokio::test]
async fn test_since_in_future_matches_nothing() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    let output = t
        .execute(Command::Events {
            since: Some("2999-01-01".to_string()),
            until: None,
            filters: Vec::new(),
            format: None,
            stream: false,
        })
        .await
        .unwrap();
    assert!(matches!(output, Output::Lines(lines) if lines.is_empty()));
}

#[tokio::test]
async fn test_invalid_time_rejected() {
    let t = engine();
    let err = t
        .execute(Command::Events {
            since: Some("yesterday-ish".to_string()),
            until: None,
            filters: Vec::new(),
            format: None,
            stream: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 125);
}

// =============================================================================
// Filters
// =============================================================================

#[tokio::test]
async fn test_filters_on_different_keys_combine_with_and() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    run(&t, "db", &["top"]).await;

    let starts = parse(&events(&t, &["event=start"], None).await);
    assert_eq!(starts.len(), 2);

    let web = parse(&events(&t, &["event=start", "container=web"], None).await);
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].name, "web");

    // Repeating a key widens the match.
    let both = parse(&events(&t, &["container=web", "container=db", "status=start"], None).await);
    assert_eq!(both.len(), 2);
}

#[tokio::test]
async fn test_unknown_filter_key_matches_nothing() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    assert!(events(&t, &["bogus=1"], None).await.is_empty());
}

#[tokio::test]
async fn test_label_and_image_filters() {
    let t = engine();
    let mut labelled = common::spec("web", &["top"]);
    labelled.labels.insert("tier".to_string(), "front".to_string());
    t.containers().create(labelled).unwrap();
    t.containers().create(common::spec("db", &["top"])).unwrap();

    let front = parse(&events(&t, &["label=tier=front"], None).await);
    assert_eq!(front.len(), 1);
    assert_eq!(front[0].name, "web");

    let images = parse(&events(&t, &["type=image"], None).await);
    assert!(images.iter().all(|e| e.kind == EventType::Image));
    assert!(images.iter().any(|e| e.status == EventStatus::Import));
}

// =============================================================================
// Contents
// =============================================================================

#[tokio::test]
async fn test_died_event_carries_exit_code() {
    let t = engine();
    run(&t, "quick", &["false"]).await;
    let code = t
        .containers()
        .wait("quick", &[], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(code, 1);

    let died = parse(&events(&t, &["event=died"], None).await);
    assert_eq!(died.len(), 1);
    assert_eq!(died[0].attributes["containerExitCode"], "1");
    assert!(died[0].image.as_deref().unwrap().contains(common::ALPINE));
}

#[tokio::test]
async fn test_human_rendering() {
    let t = engine();
    let web = run(&t, "web", &["top"]).await;
    let output = t
        .execute(Command::Events {
            since: None,
            until: None,
            filters: vec!["event=start".to_string()],
            format: None,
            stream: false,
        })
        .await
        .unwrap();
    let Output::Lines(lines) = output else {
        panic!("events must print lines");
    };
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(&format!("container start {}", web.id)));
    assert!(lines[0].contains("name=web"));
}

#[tokio::test]
async fn test_event_times_never_decrease() {
    let t = engine();
    run(&t, "a", &["top"]).await;
    t.containers().stop("a", Some(1)).await.unwrap();
    let all = t.events().all();
    assert!(all.windows(2).all(|w| w[0].time <= w[1].time));
}

#[tokio::test]
async fn test_events_survive_reopen() {
    let t = engine();
    run(&t, "web", &["top"]).await;
    t.containers().stop("web", Some(1)).await.unwrap();
    assert_eq!(common::status(&t, "web"), ContainerStatus::Stopped);

    let reopened = open(&t.temp, &t.supervisor);
    let recorded = reopened
        .events()
        .query(EventQuery {
            filters: vec!["container=web".parse().unwrap()],
            ..EventQuery::default()
        })
        .await
        .unwrap();
    assert!(recorded.iter().any(|e| e.status == EventStatus::Create));
    assert!(recorded.iter().any(|e| e.status == EventStatus::Stop));
}

#[tokio::test]
async fn test_until_sees_events_from_another_engine() {
    let t = engine();
    let other = open(&t.temp, &t.supervisor);

    let late = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        run(&other, "late", &["top"]).await;
    };
    let (lines, ()) = tokio::join!(events(&t, &["event=start"], Some("1s")), late);

    let collected = parse(&lines);
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].name, "late");
}

#[tokio::test]
async fn test_stream_follows_until_stopped() {
    let t = engine();
    run(&t, "before", &["top"]).await;
    let mut stream = t.events().stream(EventQuery {
        filters: vec!["event=start".parse().unwrap()],
        stream: true,
        ..EventQuery::default()
    });
    let first = stream.next().await.unwrap();
    assert_eq!(first.name, "before");

    let (next, _) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(5), stream.next()),
        run(&t, "after", &["top"])
    );
    assert_eq!(next.unwrap().unwrap().name, "after");
}

#[tokio::test]
async fn test_format_template() {
    let t = engine();
    let web = run(&t, "web", &["top"]).await;
    let output = t
        .execute(Command::Events {
            since: None,
            until: None,
            filters: vec!["event=start".to_string()],
            format: Some("{{.Status}} {{.Name}} {{.ID}}".to_string()),
            stream: false,
        })
        .await
        .unwrap();
    let Output::Lines(lines) = output else {
        panic!("events must print lines");
    };
    assert_eq!(lines, vec![format!("start web {}", web.id)]);

    let err = t
        .execute(Command::Events {
            since: None,
            until: None,
            filters: Vec::new(),
            format: Some("{{.Colour}}".to_string()),
            stream: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), magikpod::ErrorKind::InvalidSpec);
}

#[tokio::test]
async fn test_unbounded_stream_cannot_be_collected() {
    let t = engine();
    let err = t
        .execute(Command::Events {
            since: None,
            until: None,
            filters: Vec::new(),
            format: None,
            stream: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), magikpod::ErrorKind::InvalidSpec);
}
