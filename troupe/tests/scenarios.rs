//! End-to-end scenarios over the full runtime with a scripted backend.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use troupe::llm::mock::{MockBackend, MockTurn};
use troupe::model::RunStatus;
use troupe::tool::{Tool, ToolContext, ToolError};
use troupe::{AgentSpec, Event, EventBody, Runtime, TeamFlags, TeamSpec};

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::kind).collect()
}

fn deltas_for(events: &[Event], producer: &str) -> String {
    events
        .iter()
        .filter(|e| e.producer_id == producer)
        .filter_map(|e| match &e.body {
            EventBody::ContentDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn delegation(member_id: &str, task: &str) -> MockTurn {
    MockTurn::default().tool_call(
        "delegate_task_to_member",
        json!({
            "member_id": member_id,
            "task_description": task,
            "expected_output": "a concise answer",
        }),
    )
}

async fn build_runtime(backend: MockBackend, team: TeamSpec) -> Runtime {
    Runtime::builder()
        .backend(Arc::new(backend))
        .team(team)
        .without_memory()
        .build()
        .await
        .expect("runtime builds")
}

// -- scenario 1: direct answer, no delegation -------------------------------

#[tokio::test]
async fn direct_answer_without_delegation() {
    let backend = MockBackend::new().on("What is 2+2?", vec![MockTurn::text("2 + 2 = 4")]);
    let team = TeamSpec::new("math_team", "math_team")
        .instructions("Answer directly when you can.")
        .member(AgentSpec::new("math_agent", "Math Agent").role("Does arithmetic"));
    let runtime = build_runtime(backend, team).await;

    let handle = runtime
        .run("user-1", None, "What is 2+2?", "math_team")
        .await
        .expect("run starts");
    let run_id = handle.run_id().to_owned();
    let events = handle.collect().await;

    let kinds = kinds(&events);
    assert_eq!(kinds.first(), Some(&"run_started"));
    assert_eq!(kinds.last(), Some(&"run_completed"));
    assert!(!kinds.contains(&"member_started"));

    let content = deltas_for(&events, "math_team");
    assert!(content.contains('4'), "content was: {content}");

    let run = runtime
        .records()
        .get_run(&run_id)
        .await
        .expect("get run")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        runtime.final_output(&run_id).await.expect("output"),
        Some("2 + 2 = 4".to_owned())
    );
}

// -- scenario 2: single delegation, leader synthesizes ----------------------

#[tokio::test]
async fn single_delegation_with_synthesis() {
    let backend = MockBackend::new()
        .on(
            "Route weather and news questions",
            vec![
                delegation("weather", "Report the current weather in Tokyo"),
                MockTurn::text("Tokyo is sunny at 24C right now."),
            ],
        )
        .on(
            "You report current weather",
            vec![MockTurn::text("Sunny, 24C in Tokyo.")],
        );
    let team = TeamSpec::new("search_team", "search_team")
        .instructions("Route weather and news questions to the right specialist.")
        .member(
            AgentSpec::new("weather", "Weather Agent")
                .role("Weather lookups")
                .instructions("You report current weather conditions."),
        )
        .member(
            AgentSpec::new("news", "News Agent")
                .role("News lookups")
                .instructions("You report news headlines."),
        );
    let runtime = build_runtime(backend, team).await;

    let handle = runtime
        .run("user-1", None, "What is the weather in Tokyo?", "search_team")
        .await
        .expect("run starts");
    let events = handle.collect().await;
    let kinds = kinds(&events);

    // The weather member ran; the news member did not.
    let started_members: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::MemberStarted { member_id, .. } => Some(member_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started_members, vec!["weather"]);
    assert!(!events.iter().any(|e| e.producer_id.contains("news")));

    let member_completed = events
        .iter()
        .position(|e| matches!(&e.body, EventBody::MemberCompleted { member_id, status, .. }
            if member_id == "weather" && *status == RunStatus::Succeeded))
        .expect("member_completed present");

    // Leader synthesis streams after the member completed.
    let leader_delta = events
        .iter()
        .position(|e| {
            e.producer_id == "search_team" && matches!(&e.body, EventBody::ContentDelta { .. })
        })
        .expect("leader content present");
    assert!(member_completed < leader_delta);
    assert_eq!(kinds.last(), Some(&"run_completed"));

    // The member's sub-run is bracketed on its own producer.
    let child: Vec<&str> = events
        .iter()
        .filter(|e| e.producer_id == "search_team/weather")
        .map(|e| e.kind())
        .collect();
    assert_eq!(child.first(), Some(&"run_started"));
    assert!(child.contains(&"run_completed"));
    assert!(deltas_for(&events, "search_team/weather").contains("Sunny"));
}

// -- scenario 3: router via respond_directly --------------------------------

#[tokio::test]
async fn respond_directly_adopts_member_output() {
    let member_answer = "¡Hola! Estoy muy bien, gracias.";
    let backend = MockBackend::new()
        .on(
            "Route each message to the agent matching its language",
            vec![delegation("spanish_agent", "Reply to the user in Spanish")],
        )
        .on("You reply in Spanish", vec![MockTurn::text(member_answer)]);
    let team = TeamSpec::new("router_team", "router_team")
        .instructions("Route each message to the agent matching its language.")
        .member(
            AgentSpec::new("english_agent", "English Agent")
                .instructions("You reply in English."),
        )
        .member(
            AgentSpec::new("spanish_agent", "Spanish Agent")
                .instructions("You reply in Spanish."),
        )
        .flags(TeamFlags {
            respond_directly: true,
            determine_input_for_members: false,
            ..TeamFlags::default()
        });
    let runtime = build_runtime(backend, team).await;

    let handle = runtime
        .run("user-1", None, "Hola, ¿cómo estás?", "router_team")
        .await
        .expect("run starts");
    let run_id = handle.run_id().to_owned();
    let events = handle.collect().await;

    // Content is authored by the member; the leader streams nothing.
    assert!(deltas_for(&events, "router_team").is_empty());
    assert_eq!(
        deltas_for(&events, "router_team/spanish_agent"),
        member_answer
    );

    // The run output equals the member output byte-for-byte.
    assert_eq!(
        runtime.final_output(&run_id).await.expect("output"),
        Some(member_answer.to_owned())
    );
    assert_eq!(kinds(&events).last(), Some(&"run_completed"));

    // determine_input_for_members=false passes the user input through.
    let member_started_task = events.iter().find_map(|e| match &e.body {
        EventBody::MemberStarted { member_id, task } if member_id == "spanish_agent" => {
            Some(task.clone())
        }
        _ => None,
    });
    assert!(member_started_task.is_some());
}

// -- scenario 4: delegate_to_all_members ------------------------------------

#[tokio::test]
async fn delegate_to_all_fans_out_and_synthesizes() {
    let backend = MockBackend::new()
        .on(
            "Gather developer sentiment from every researcher",
            vec![
                delegation("reddit_researcher", "Summarize developer opinions"),
                MockTurn::text("Across both communities, opinions are mixed but warming."),
            ],
        )
        .on("You research reddit", vec![MockTurn::text("Reddit is skeptical.")])
        .on(
            "You research hacker news",
            vec![MockTurn::text("HN is cautiously positive.")],
        );
    let team = TeamSpec::new("research_team", "research_team")
        .instructions("Gather developer sentiment from every researcher, then synthesize.")
        .member(
            AgentSpec::new("reddit_researcher", "Reddit Researcher")
                .instructions("You research reddit threads."),
        )
        .member(
            AgentSpec::new("hn_researcher", "HN Researcher")
                .instructions("You research hacker news threads."),
        )
        .flags(TeamFlags {
            delegate_to_all_members: true,
            ..TeamFlags::default()
        });
    let runtime = build_runtime(backend, team).await;

    let handle = runtime
        .run(
            "user-1",
            None,
            "What do developers think of AI code assistants?",
            "research_team",
        )
        .await
        .expect("run starts");
    let events = handle.collect().await;

    let mut started: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::MemberStarted { member_id, .. } => Some(member_id.clone()),
            _ => None,
        })
        .collect();
    started.sort();
    assert_eq!(started, vec!["hn_researcher", "reddit_researcher"]);

    let completed = events
        .iter()
        .filter(|e| matches!(&e.body, EventBody::MemberCompleted { status, .. }
            if *status == RunStatus::Succeeded))
        .count();
    assert_eq!(completed, 2);

    let synthesis = deltas_for(&events, "research_team");
    assert!(synthesis.contains("mixed"), "synthesis was: {synthesis}");
    assert_eq!(kinds(&events).last(), Some(&"run_completed"));
}

#[tokio::test]
async fn respond_directly_with_delegate_to_all_is_rejected_at_validation() {
    let team = TeamSpec::new("bad_team", "bad_team")
        .member(AgentSpec::new("a", "A"))
        .flags(TeamFlags {
            respond_directly: true,
            delegate_to_all_members: true,
            ..TeamFlags::default()
        });
    let result = Runtime::builder()
        .backend(Arc::new(MockBackend::new()))
        .team(team)
        .without_memory()
        .build()
        .await;
    assert!(result.is_err());
}

// -- scenario 5: memory isolation -------------------------------------------

#[tokio::test]
async fn memory_is_isolated_between_users() {
    let backend = MockBackend::new()
        .on(
            "two kids named Ana and Ben",
            vec![MockTurn::text(
                r#"[{"topics": ["family"], "text": "Has two kids named Ana and Ben"}]"#,
            )],
        )
        .on(
            "You recall facts about the user",
            vec![
                MockTurn::default().tool_call(
                    "memory_search",
                    json!({"query": "family", "topics": ["family"]}),
                ),
                MockTurn::text("I don't have anything about your family."),
            ],
        );

    let runtime = Runtime::builder()
        .backend(Arc::new(backend))
        .agent(
            AgentSpec::new("recall_agent", "Recall Agent")
                .instructions("You recall facts about the user via memory_search.")
                .tool("memory_search"),
        )
        .build()
        .await
        .expect("runtime builds");

    // Seed user A's memory through the extraction path.
    let memory = runtime.memory().expect("memory enabled").clone();
    let created = memory
        .create("user-a", None, "User: I have two kids named Ana and Ben.")
        .await
        .expect("create");
    assert_eq!(created.len(), 1);

    // User B searches the same topic through a run.
    let handle = runtime
        .run("user-b", None, "What do you know about my family?", "recall_agent")
        .await
        .expect("run starts");
    let events = handle.collect().await;

    let search_result = events
        .iter()
        .find_map(|e| match &e.body {
            EventBody::ToolCallCompleted {
                tool_name, result, ..
            } if tool_name == "memory_search" => result.clone(),
            _ => None,
        })
        .expect("memory_search completed");
    assert_eq!(search_result, json!([]), "user B must see no memories");

    let metrics = events
        .iter()
        .filter(|e| matches!(e.body, EventBody::Metrics { .. }))
        .count();
    assert_eq!(metrics, 1);

    // Direct subsystem checks: A sees its memory, B does not.
    assert_eq!(
        memory
            .search("user-a", &["family".into()], "kids", 10)
            .await
            .expect("search")
            .len(),
        1
    );
    assert!(
        memory
            .search("user-b", &["family".into()], "kids", 10)
            .await
            .expect("search")
            .is_empty()
    );
}

// -- scenario 6: cancellation mid-delegation --------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
struct ProbeArgs {}

#[derive(Debug, Clone, Copy, Default)]
struct SlowProbe;

#[async_trait]
impl Tool for SlowProbe {
    const NAME: &'static str = "slow_probe";
    type Args = ProbeArgs;
    type Output = String;

    fn description(&self) -> String {
        "A probe that takes ten seconds.".to_owned()
    }

    async fn call(&self, _ctx: &ToolContext, _args: Self::Args) -> Result<Self::Output, ToolError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok("probe data".to_owned())
    }
}

#[tokio::test]
async fn cancellation_mid_delegation_terminates_within_grace() {
    let backend = MockBackend::new()
        .on(
            "Route weather questions",
            vec![delegation("weather", "Probe the weather station")],
        )
        .on(
            "You probe weather stations",
            vec![
                MockTurn::default().tool_call("slow_probe", json!({})),
                MockTurn::text("unreachable"),
            ],
        );
    let team = TeamSpec::new("slow_team", "slow_team")
        .instructions("Route weather questions to the weather member.")
        .member(
            AgentSpec::new("weather", "Weather Agent")
                .instructions("You probe weather stations.")
                .tool("slow_probe"),
        );
    let runtime = Runtime::builder()
        .backend(Arc::new(backend))
        .team(team)
        .tool(SlowProbe)
        .without_memory()
        .build()
        .await
        .expect("runtime builds");

    let mut handle = runtime
        .run("user-1", None, "What is the weather in Tokyo?", "slow_team")
        .await
        .expect("run starts");
    let run_id = handle.run_id().to_owned();

    // Let the delegation reach the slow tool, then cancel.
    let mut seen = Vec::new();
    while let Some(event) = handle.next_event().await {
        let is_tool_start = matches!(&event.body, EventBody::ToolCallStarted { tool_name, .. }
            if tool_name == "slow_probe");
        seen.push(event);
        if is_tool_start {
            break;
        }
    }
    handle.cancel();

    let started = std::time::Instant::now();
    let mut rest = handle.collect().await;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stream must close within the grace period"
    );
    seen.append(&mut rest);

    let kinds = kinds(&seen);
    assert_eq!(kinds.last(), Some(&"run_cancelled"));
    assert!(!kinds.contains(&"run_completed") || {
        // A member sub-run may complete; the *root* must not.
        !seen.iter().any(|e| {
            e.producer_id == "slow_team" && matches!(e.body, EventBody::RunCompleted { .. })
        })
    });

    let run = runtime
        .records()
        .get_run(&run_id)
        .await
        .expect("get run")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Cancelled);
}
