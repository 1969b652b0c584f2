//! Cross-cutting runtime properties: event sequencing, replay, run
//! independence, and configuration boundary behavior.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use troupe::llm::mock::{FailingBackend, MockBackend, MockTurn};
use troupe::model::RunStatus;
use troupe::{AgentSpec, Event, EventBody, Runtime, RuntimeConfig, TeamSpec};

fn delegation(member_id: &str, task: &str) -> MockTurn {
    MockTurn::default().tool_call(
        "delegate_task_to_member",
        json!({
            "member_id": member_id,
            "task_description": task,
            "expected_output": "short answer",
        }),
    )
}

fn routed_backend() -> MockBackend {
    MockBackend::new()
        .on(
            "Route lookup questions",
            vec![
                delegation("lookup", "Look up the answer"),
                MockTurn::text("The looked-up answer is 42."),
            ],
        )
        .on("You look things up", vec![MockTurn::text("It is 42.")])
}

fn routed_team() -> TeamSpec {
    TeamSpec::new("route_team", "route_team")
        .instructions("Route lookup questions to the lookup member.")
        .member(
            AgentSpec::new("lookup", "Lookup Agent").instructions("You look things up quickly."),
        )
}

async fn routed_runtime() -> Runtime {
    Runtime::builder()
        .backend(Arc::new(routed_backend()))
        .team(routed_team())
        .without_memory()
        .build()
        .await
        .expect("runtime builds")
}

#[tokio::test]
async fn per_producer_seq_is_gap_free_across_a_delegated_run() {
    let runtime = routed_runtime().await;
    let handle = runtime
        .run("user-1", None, "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let events = handle.collect().await;

    let mut by_producer: HashMap<&str, Vec<u64>> = HashMap::new();
    for event in &events {
        by_producer
            .entry(event.producer_id.as_str())
            .or_default()
            .push(event.seq);
    }

    assert!(by_producer.len() >= 2, "leader and member producers expected");
    for (producer, seqs) in by_producer {
        let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
        assert_eq!(seqs, expected, "gap or reorder for producer {producer}");
    }

    // run_seq is strictly increasing in delivery order.
    let run_seqs: Vec<u64> = events.iter().map(|e| e.run_seq).collect();
    let mut sorted = run_seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(run_seqs.len(), sorted.len());
}

#[tokio::test]
async fn member_run_completed_precedes_parent_tool_completion() {
    let runtime = routed_runtime().await;
    let handle = runtime
        .run("user-1", None, "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let events = handle.collect().await;

    let child_done = events
        .iter()
        .position(|e| {
            e.producer_id == "route_team/lookup"
                && matches!(e.body, EventBody::RunCompleted { .. })
        })
        .expect("child run_completed");
    let parent_tool_done = events
        .iter()
        .position(|e| {
            e.producer_id == "route_team"
                && matches!(&e.body, EventBody::ToolCallCompleted { tool_name, .. }
                    if tool_name == "delegate_task_to_member")
        })
        .expect("parent tool_call_completed");
    assert!(child_done < parent_tool_done);
}

#[tokio::test]
async fn replaying_persisted_events_reproduces_the_output() {
    let runtime = routed_runtime().await;
    let handle = runtime
        .run("user-1", None, "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let run_id = handle.run_id().to_owned();
    let _ = handle.collect().await;

    let replayed = runtime.replay_output(&run_id).await.expect("replay");
    let stored = runtime
        .final_output(&run_id)
        .await
        .expect("output")
        .expect("present");
    assert_eq!(replayed, stored);

    // Persisted events carry the same per-producer ordering guarantees.
    let persisted = runtime.records().list_events(&run_id).await.expect("events");
    assert!(!persisted.is_empty());
    let mut last_run_seq = 0;
    for record in &persisted {
        assert!(record.run_seq > last_run_seq);
        last_run_seq = record.run_seq;
    }
}

#[tokio::test]
async fn identical_submissions_produce_independent_runs() {
    let runtime = routed_runtime().await;

    let first = runtime
        .run("user-1", None, "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let first_id = first.run_id().to_owned();
    let session_id = runtime
        .records()
        .get_run(&first_id)
        .await
        .expect("get")
        .expect("exists")
        .session_id;
    let _ = first.collect().await;

    let second = runtime
        .run("user-1", Some(&session_id), "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let second_id = second.run_id().to_owned();
    let _ = second.collect().await;

    assert_ne!(first_id, second_id);
    for run_id in [&first_id, &second_id] {
        let run = runtime
            .records()
            .get_run(run_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.session_id, session_id);
    }
}

#[tokio::test]
async fn tool_round_cap_of_one_still_succeeds_with_an_error_event() {
    let backend = MockBackend::new().on(
        "You always check memory first",
        vec![
            MockTurn::default().tool_call("memory_search", json!({"query": "anything"})),
            MockTurn::text("Answer without further lookups.")
                .tool_call("memory_search", json!({"query": "again"})),
        ],
    );
    let runtime = Runtime::builder()
        .backend(Arc::new(backend))
        .config(RuntimeConfig {
            max_tool_rounds: 1,
            ..RuntimeConfig::default()
        })
        .agent(
            AgentSpec::new("checker", "Checker Agent")
                .instructions("You always check memory first.")
                .tool("memory_search"),
        )
        .build()
        .await
        .expect("runtime builds");

    let handle = runtime
        .run("user-1", None, "Tell me something", "checker")
        .await
        .expect("run starts");
    let run_id = handle.run_id().to_owned();
    let events = handle.collect().await;

    let cap_errors: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(&e.body, EventBody::Error { error_kind, fatal, .. }
            if *error_kind == troupe::ErrorKind::Internal && !fatal))
        .collect();
    assert!(!cap_errors.is_empty(), "round-cap error event expected");

    assert!(matches!(
        events.last().map(|e| &e.body),
        Some(EventBody::RunCompleted { .. })
    ));
    let run = runtime
        .records()
        .get_run(&run_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        runtime.final_output(&run_id).await.expect("output").as_deref(),
        Some("Answer without further lookups.")
    );
}

#[tokio::test]
async fn zero_delegation_rounds_degenerates_to_the_leader() {
    let backend = MockBackend::new().on(
        "Route lookup questions",
        vec![
            // The leader tries to delegate anyway; the refusal comes back
            // as a tool error and it must answer itself.
            delegation("lookup", "Look up the answer"),
            MockTurn::text("I will answer this myself: 42."),
        ],
    );
    let runtime = Runtime::builder()
        .backend(Arc::new(backend))
        .config(RuntimeConfig {
            max_delegation_rounds: 0,
            ..RuntimeConfig::default()
        })
        .team(routed_team())
        .without_memory()
        .build()
        .await
        .expect("runtime builds");

    let handle = runtime
        .run("user-1", None, "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let events = handle.collect().await;

    assert!(!events.iter().any(|e| matches!(e.body, EventBody::MemberStarted { .. })));
    assert!(!events.iter().any(|e| e.producer_id.contains('/')));
    assert!(matches!(
        events.last().map(|e| &e.body),
        Some(EventBody::RunCompleted { .. })
    ));
}

#[tokio::test]
async fn fatal_backend_failure_fails_the_run() {
    let runtime = Runtime::builder()
        .backend(Arc::new(FailingBackend))
        .agent(AgentSpec::new("solo", "Solo Agent"))
        .without_memory()
        .build()
        .await
        .expect("runtime builds");

    let handle = runtime
        .run("user-1", None, "hello", "solo")
        .await
        .expect("run starts");
    let run_id = handle.run_id().to_owned();
    let events = handle.collect().await;

    assert!(matches!(
        events.last().map(|e| &e.body),
        Some(EventBody::RunFailed { .. })
    ));
    let run = runtime
        .records()
        .get_run(&run_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
}

#[tokio::test]
async fn startup_recovery_fails_runs_left_behind_by_a_crash() {
    use chrono::Utc;
    use troupe::model::{RunRecord, SessionRecord};
    use troupe::store::{RecordStore, SqliteRecordStore};

    let store = Arc::new(SqliteRecordStore::in_memory().expect("store"));
    store
        .insert_session(&SessionRecord {
            session_id: "s1".into(),
            user_id: "u1".into(),
            name: "old".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_id: None,
        })
        .await
        .expect("session");
    store
        .insert_run(&RunRecord {
            run_id: "crashed".into(),
            session_id: "s1".into(),
            user_id: "u1".into(),
            status: RunStatus::Streaming,
            started_at: Utc::now(),
            finished_at: None,
            input_ref: None,
            output_ref: None,
            error: None,
        })
        .await
        .expect("run");

    // Building the runtime performs the recovery sweep.
    let runtime = Runtime::builder()
        .backend(Arc::new(MockBackend::new()))
        .records(store)
        .agent(AgentSpec::new("solo", "Solo Agent"))
        .without_memory()
        .build()
        .await
        .expect("runtime builds");

    let run = runtime
        .records()
        .get_run("crashed")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn unknown_member_delegation_recovers_with_a_retry() {
    let backend = MockBackend::new()
        .on(
            "Route lookup questions",
            vec![
                delegation("nonexistent", "Look up the answer"),
                delegation("lookup", "Look up the answer"),
                MockTurn::text("Recovered: the answer is 42."),
            ],
        )
        .on("You look things up", vec![MockTurn::text("It is 42.")]);
    let runtime = Runtime::builder()
        .backend(Arc::new(backend))
        .team(routed_team())
        .without_memory()
        .build()
        .await
        .expect("runtime builds");

    let handle = runtime
        .run("user-1", None, "Look this up for me", "route_team")
        .await
        .expect("run starts");
    let events = handle.collect().await;

    // First delegation failed with invalid_args, second succeeded.
    let invalid = events.iter().any(|e| {
        matches!(&e.body, EventBody::ToolCallCompleted { tool_name, error_kind, .. }
            if tool_name == "delegate_task_to_member"
                && *error_kind == Some(troupe::ErrorKind::InvalidArgs))
    });
    assert!(invalid);
    assert!(events.iter().any(|e| {
        matches!(&e.body, EventBody::MemberCompleted { member_id, status, .. }
            if member_id == "lookup" && *status == RunStatus::Succeeded)
    }));
    assert!(matches!(
        events.last().map(|e| &e.body),
        Some(EventBody::RunCompleted { .. })
    ));
}
