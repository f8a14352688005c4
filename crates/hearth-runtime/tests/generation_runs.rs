//! End-to-end generation runs against in-memory collaborators

use async_trait::async_trait;
use hearth_artifacts::{
    ArtifactBackend, ArtifactUpsert, ArtifactValue, InMemoryArtifactBackend,
    PersistedArtifactStore, RunArtifactStore, StoredArtifact, WriteOutcome,
};
use hearth_core::{
    ExecutionMode, GenerationSettings, HearthError, Hook, Persistence, PromptMessage, Result,
    RetentionPolicy, Role, SessionKey, WriterId,
};
use hearth_llm::ScriptedLlmClient;
use hearth_runtime::{
    CancellationRegistry, CollectingEventSink, CommitStatus, EffectCommitStatus, EffectKind,
    FailedType, FinalizeReport, FinishedStatus, GenerationRequest, GenerationRuntime,
    InMemoryTurnPersistence, MiniJinjaRenderer, OperationConfig, OperationOutput, PhaseStatus,
    PromptTimeOutput, RenderOptions, RunOutcome, RunPhase, SystemUpdateMode, TaskStatus,
    TemplateRenderer, TurnPersistence, TurnRef, TurnTarget,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn session() -> SessionKey {
    SessionKey::new("owner-1", "chat-1")
}

fn artifact(tag: &str, persistence: Persistence) -> OperationOutput {
    OperationOutput::Artifacts {
        tag: tag.to_string(),
        persistence,
        usage: String::new(),
        semantics: String::new(),
    }
}

fn before(id: &str, template: &str, output: OperationOutput) -> OperationConfig {
    OperationConfig::template(id, Hook::BeforeMainLlm, template, output)
}

fn after(id: &str, template: &str, output: OperationOutput) -> OperationConfig {
    OperationConfig::template(id, Hook::AfterMainLlm, template, output)
}

/// Renderer that blocks for a varying few milliseconds per call so that
/// concurrent siblings finish in different orders from run to run
struct JitterRenderer {
    inner: MiniJinjaRenderer,
    calls: AtomicU64,
}

impl JitterRenderer {
    fn new() -> Self {
        Self {
            inner: MiniJinjaRenderer::new(),
            calls: AtomicU64::new(0),
        }
    }
}

impl TemplateRenderer for JitterRenderer {
    fn render(&self, template: &str, context: &Value, options: RenderOptions) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis((call * 7) % 5));
        self.inner.render(template, context, options)
    }
}

struct Harness {
    runtime: GenerationRuntime,
    turns: Arc<InMemoryTurnPersistence>,
    sink: Arc<CollectingEventSink>,
    llm: ScriptedLlmClient,
    store: PersistedArtifactStore,
}

impl Harness {
    fn new(llm: ScriptedLlmClient) -> Self {
        Self::with_renderer(llm, Arc::new(MiniJinjaRenderer::new()))
    }

    fn with_renderer(llm: ScriptedLlmClient, renderer: Arc<dyn TemplateRenderer>) -> Self {
        let store = PersistedArtifactStore::new(
            Arc::new(InMemoryArtifactBackend::new()),
            RetentionPolicy::default(),
        );
        Self::with_store(llm, renderer, store)
    }

    fn with_store(
        llm: ScriptedLlmClient,
        renderer: Arc<dyn TemplateRenderer>,
        store: PersistedArtifactStore,
    ) -> Self {
        let turns = Arc::new(InMemoryTurnPersistence::new());
        let sink = Arc::new(CollectingEventSink::new());
        let runtime = GenerationRuntime::new(renderer, Arc::new(llm.clone()), turns.clone())
            .with_event_sink(sink.clone())
            .with_persisted_store(store.clone());
        Self {
            runtime,
            turns,
            sink,
            llm,
            store,
        }
    }

    async fn run(&self, request: GenerationRequest) -> RunOutcome {
        self.runtime.run_chat_generation(request).await.unwrap()
    }
}

fn request(run_id: &str, operations: Vec<OperationConfig>) -> GenerationRequest {
    GenerationRequest::new(session(), "u")
        .with_run_id(run_id)
        .with_system_prompt("sys")
        .with_operations(operations)
}

#[tokio::test]
async fn test_world_state_scenario() {
    let harness = Harness::new(ScriptedLlmClient::from_text("reply"));
    let operations = vec![
        before("world", "WORLD", artifact("world_state", Persistence::RunOnly)),
        before(
            "note",
            "note={{ art.world_state }}",
            OperationOutput::PromptTime(PromptTimeOutput::AppendAfterLastUser {
                role: Role::Developer,
            }),
        )
        .with_depends_on(["world"]),
    ];

    let outcome = harness.run(request("scenario", operations)).await;

    assert_eq!(outcome.status, FinishedStatus::Done);
    assert_eq!(
        outcome.state.effective_prompt_draft,
        vec![
            PromptMessage::system("sys"),
            PromptMessage::user("u"),
            PromptMessage::developer("note=WORLD"),
        ]
    );
    assert_eq!(
        outcome.state.base_prompt_draft,
        vec![PromptMessage::system("sys"), PromptMessage::user("u")]
    );
    assert_eq!(
        outcome.state.run_artifacts.get("world_state").unwrap().value,
        "WORLD"
    );

    // The main LLM saw the committed draft
    let sent = harness.llm.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].messages, outcome.state.effective_prompt_draft);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_is_deterministic_under_concurrency() {
    let operations = vec![
        before("a", "A", artifact("a", Persistence::RunOnly)),
        before("b", "{{ art.a }}>b", artifact("b", Persistence::RunOnly)).with_depends_on(["a"]),
        before("c", "{{ art.a }}>c", artifact("c", Persistence::RunOnly)).with_depends_on(["a"]),
        before("d", "[{{ art.b }}|{{ art.c }}]", artifact("merged", Persistence::RunOnly))
            .with_depends_on(["b", "c"]),
        before(
            "note",
            "{{ art.merged }}",
            OperationOutput::PromptTime(PromptTimeOutput::InsertAtDepth {
                role: Role::System,
                depth_from_end: 1,
            }),
        )
        .with_depends_on(["d"]),
    ];

    let mut fingerprints = Vec::new();
    for i in 0..10 {
        let harness = Harness::with_renderer(
            ScriptedLlmClient::from_text("ok"),
            Arc::new(JitterRenderer::new()),
        );
        let run = request(&format!("diamond-{}", i), operations.clone())
            .with_execution_mode(ExecutionMode::Concurrent);
        let outcome = harness.run(run).await;

        assert_eq!(outcome.status, FinishedStatus::Done);
        assert_eq!(outcome.state.run_artifacts.get("merged").unwrap().value, "[A>b|A>c]");

        let fingerprint = serde_json::to_string(&(
            &outcome.state.operation_results_by_hook,
            &outcome.state.commit_reports_by_hook,
            &outcome.state.effective_prompt_draft,
            &outcome.state.run_artifacts,
        ))
        .unwrap();
        fingerprints.push(fingerprint);
    }

    assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_siblings_never_see_each_other() {
    let operations = vec![
        before(
            "left",
            "{% if art.right %}saw right{% else %}absent{% endif %}",
            artifact("left", Persistence::RunOnly),
        ),
        before(
            "right",
            "{% if art.left %}saw left{% else %}absent{% endif %}",
            artifact("right", Persistence::RunOnly),
        ),
    ];

    for mode in [ExecutionMode::Sequential, ExecutionMode::Concurrent] {
        for i in 0..5 {
            let harness = Harness::with_renderer(
                ScriptedLlmClient::from_text("ok"),
                Arc::new(JitterRenderer::new()),
            );
            let run = request(&format!("siblings-{}-{}", mode, i), operations.clone())
                .with_execution_mode(mode);
            let outcome = harness.run(run).await;

            assert_eq!(outcome.state.run_artifacts.get("left").unwrap().value, "absent");
            assert_eq!(outcome.state.run_artifacts.get("right").unwrap().value, "absent");
        }
    }
}

#[tokio::test]
async fn test_required_failure_blocks_main_llm() {
    let harness = Harness::new(ScriptedLlmClient::from_text("never"));
    let operations = vec![
        before("broken", "{{ undefined_thing }}", artifact("x", Persistence::RunOnly))
            .with_required(true)
            .with_strict_variables(true),
        before("fine", "ok", artifact("y", Persistence::RunOnly)),
    ];

    let outcome = harness.run(request("barrier", operations)).await;

    assert_eq!(outcome.status, FinishedStatus::Failed);
    assert_eq!(outcome.failed_type, Some(FailedType::BeforeBarrier));
    assert!(!harness.sink.names().contains(&"main_llm.started"));
    assert!(harness.llm.requests().is_empty());

    let results = &outcome.state.operation_results_by_hook[&Hook::BeforeMainLlm];
    let broken = results.iter().find(|r| r.op_id == "broken").unwrap();
    assert_eq!(broken.status, TaskStatus::Error);
    assert_eq!(broken.error.as_ref().unwrap().code, "template_error");

    // Optional work still committed
    assert_eq!(outcome.state.run_artifacts.get("y").unwrap().value, "ok");
    assert_eq!(harness.turns.finalized().len(), 1);
    assert_eq!(harness.turns.finalized()[0].status, FinishedStatus::Failed);
}

#[tokio::test]
async fn test_optional_failure_does_not_block() {
    let harness = Harness::new(ScriptedLlmClient::from_text("fine"));
    let operations = vec![before("broken", "{{ nope }}", artifact("x", Persistence::RunOnly))];

    let outcome = harness.run(request("optional", operations)).await;
    assert_eq!(outcome.status, FinishedStatus::Done);
    assert_eq!(outcome.state.assistant_text, "fine");
}

#[tokio::test]
async fn test_after_hook_prompt_effect_is_forbidden() {
    let harness = Harness::new(ScriptedLlmClient::from_text("answer"));
    let operations = vec![after(
        "late_system",
        "too late",
        OperationOutput::PromptTime(PromptTimeOutput::SystemUpdate {
            mode: SystemUpdateMode::Append,
        }),
    )
    .with_required(true)];

    let outcome = harness.run(request("policy", operations)).await;

    let report = &outcome.state.commit_reports_by_hook[&Hook::AfterMainLlm];
    assert_eq!(report.status, CommitStatus::Error);
    assert_eq!(report.effects[0].status, EffectCommitStatus::Error);
    assert!(report.effects[0].message.as_deref().unwrap().contains("forbidden"));

    assert_eq!(outcome.status, FinishedStatus::Failed);
    assert_eq!(outcome.failed_type, Some(FailedType::AfterMainLlm));
    assert_eq!(outcome.state.effective_prompt_draft[0].content, "sys");
    assert!(harness.sink.names().contains(&"commit.effect_error"));
}

#[tokio::test]
async fn test_after_hook_sees_assistant_turn() {
    let harness = Harness::new(ScriptedLlmClient::from_text("The cat sat."));
    let operations = vec![
        after(
            "summary",
            "{{ assistant_text | upper }}",
            artifact("summary", Persistence::RunOnly),
        ),
        after(
            "canon",
            "{{ assistant_text | trim }}!",
            OperationOutput::TurnCanonicalization {
                target: TurnTarget::Assistant,
            },
        ),
    ];

    let run = request("after", operations);
    let assistant_turn = run.assistant_turn.clone();
    let outcome = harness.run(run).await;

    assert_eq!(outcome.status, FinishedStatus::Done);
    assert_eq!(outcome.state.run_artifacts.get("summary").unwrap().value, "THE CAT SAT.");
    assert_eq!(outcome.state.assistant_text, "The cat sat.!");
    assert_eq!(
        harness.turns.text(&assistant_turn).as_deref(),
        Some("The cat sat.!")
    );
}

#[tokio::test]
async fn test_cancel_during_stream_aborts_run() {
    let registry = CancellationRegistry::new();
    let turns = Arc::new(InMemoryTurnPersistence::new());
    let sink = Arc::new(CollectingEventSink::new());
    let llm = ScriptedLlmClient::from_text("one two three four five six")
        .with_delay(Duration::from_millis(40));
    let runtime = GenerationRuntime::new(Arc::new(MiniJinjaRenderer::new()), Arc::new(llm), turns.clone())
        .with_event_sink(sink.clone())
        .with_registry(registry.clone());

    let operations = vec![after("summary", "{{ assistant_text }}", artifact("s", Persistence::RunOnly))];
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.cancel("cancel-me")
    };

    let (outcome, cancelled) = tokio::join!(
        runtime.run_chat_generation(request("cancel-me", operations)),
        canceller
    );
    let outcome = outcome.unwrap();

    assert!(cancelled);
    assert_eq!(outcome.status, FinishedStatus::Aborted);
    assert!(outcome.state.assistant_text.starts_with("one "));
    assert_ne!(outcome.state.assistant_text, "one two three four five six");
    assert!(!outcome.state.operation_results_by_hook.contains_key(&Hook::AfterMainLlm));

    // Partial text was flushed and finalize ran once
    assert_eq!(turns.flushes().last(), Some(&outcome.state.assistant_text));
    assert_eq!(turns.finalized().len(), 1);
    assert_eq!(turns.finalized()[0].status, FinishedStatus::Aborted);

    let names = sink.names();
    assert_eq!(names.iter().filter(|n| **n == "run.finished").count(), 1);
    assert_eq!(names.last(), Some(&"run.finished"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_event_seq_is_strictly_increasing() {
    let harness = Harness::new(ScriptedLlmClient::from_text("a b c"));
    let operations = vec![
        before("one", "1", artifact("one", Persistence::RunOnly)),
        before("two", "2", artifact("two", Persistence::RunOnly)),
    ];
    harness.run(request("seq", operations)).await;

    let events = harness.sink.events();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(seqs, expected);
    assert!(events.iter().all(|e| e.run_id == "seq"));
}

#[tokio::test]
async fn test_persisted_artifacts_carry_across_runs() {
    let store = PersistedArtifactStore::new(
        Arc::new(InMemoryArtifactBackend::new()),
        RetentionPolicy::default(),
    );
    let remember = after(
        "remember",
        "{{ user_text }}",
        artifact("last_topic", Persistence::Persisted),
    );
    let recall = before(
        "recall",
        "previously: {{ art.last_topic }}",
        OperationOutput::PromptTime(PromptTimeOutput::SystemUpdate {
            mode: SystemUpdateMode::Append,
        }),
    )
    .with_strict_variables(false);
    let operations = vec![remember, recall];

    let first = Harness::with_store(
        ScriptedLlmClient::from_text("ok"),
        Arc::new(MiniJinjaRenderer::new()),
        store.clone(),
    );
    let outcome = first
        .run(
            GenerationRequest::new(session(), "dragons")
                .with_run_id("first")
                .with_system_prompt("sys")
                .with_operations(operations.clone()),
        )
        .await;
    assert_eq!(outcome.status, FinishedStatus::Done);
    assert_eq!(outcome.state.effective_prompt_draft[0].content, "sys\npreviously: ");

    let second = Harness::with_store(
        ScriptedLlmClient::from_text("ok"),
        Arc::new(MiniJinjaRenderer::new()),
        store.clone(),
    );
    let outcome = second
        .run(
            GenerationRequest::new(session(), "dragons")
                .with_run_id("second")
                .with_system_prompt("sys")
                .with_operations(operations),
        )
        .await;
    assert_eq!(
        outcome.state.effective_prompt_draft[0].content,
        "sys\npreviously: dragons"
    );

    // Same value again: committed as unchanged, version stays at 1
    let report = &outcome.state.commit_reports_by_hook[&Hook::AfterMainLlm];
    assert_eq!(report.effects[0].status, EffectCommitStatus::Skipped);
    let stored = second.store.latest(&session(), "last_topic").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_persisted_write_rejects_stale_version() {
    let store = PersistedArtifactStore::new(
        Arc::new(InMemoryArtifactBackend::new()),
        RetentionPolicy::KeepAll,
    );
    let writer = WriterId::new("pipeline", "mood_step");
    let key = session();

    let v1 = store
        .upsert(&key, &ArtifactUpsert::persisted("mood", "calm"), 0, &writer)
        .await
        .unwrap();
    assert_eq!(v1.version, 1);

    let stale = store
        .upsert(&key, &ArtifactUpsert::persisted("mood", "angry"), 0, &writer)
        .await;
    assert!(matches!(stale, Err(HearthError::ArtifactConflict(_))));
    let current = store.latest(&key, "mood").await.unwrap().unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.value.value, "calm");

    let v2 = store
        .upsert(&key, &ArtifactUpsert::persisted("mood", "tense"), 1, &writer)
        .await
        .unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(v2.value.history, vec!["calm", "tense"]);

    let intruder = WriterId::new("other-pipeline", "mood_step");
    let forbidden = store
        .upsert(&key, &ArtifactUpsert::persisted("mood", "hijacked"), 2, &intruder)
        .await;
    assert!(matches!(forbidden, Err(HearthError::ArtifactForbidden(_))));
}

#[test]
fn test_run_store_round_trip() {
    let mut store = RunArtifactStore::new();
    store.upsert(&ArtifactUpsert::run_only("note", "first"));
    let value = store.upsert(&ArtifactUpsert::run_only("note", "second")).clone();

    assert_eq!(value.value, "second");
    assert_eq!(value.history, vec!["first", "second"]);
}

#[tokio::test]
async fn test_effect_payloads_are_recorded() {
    let harness = Harness::new(ScriptedLlmClient::from_text("ok"));
    let operations = vec![before(
        "canon",
        "{{ user_text | trim }}?",
        OperationOutput::TurnCanonicalization {
            target: TurnTarget::User,
        },
    )];
    let run = request("canon", operations);
    let user_turn = run.user_turn.clone();

    let outcome = harness.run(run).await;
    let results = &outcome.state.operation_results_by_hook[&Hook::BeforeMainLlm];
    assert!(matches!(
        &results[0].effects[0].kind,
        EffectKind::UserReplaceText { text } if text == "u?"
    ));
    assert_eq!(outcome.state.user_text, "u?");
    assert_eq!(outcome.state.effective_prompt_draft[1].content, "u?");
    assert_eq!(harness.turns.text(&user_turn).as_deref(), Some("u?"));
}

/// Backend whose session listing always fails
struct UnreachableBackend;

#[async_trait]
impl ArtifactBackend for UnreachableBackend {
    async fn latest(&self, _session: &SessionKey, _tag: &str) -> Result<Option<StoredArtifact>> {
        Ok(None)
    }

    async fn list_latest(&self, _session: &SessionKey) -> Result<Vec<StoredArtifact>> {
        Err(HearthError::ArtifactBackend("connection refused".to_string()))
    }

    async fn write(
        &self,
        _session: &SessionKey,
        _tag: &str,
        _version: u64,
        _value: &ArtifactValue,
        _writer: &WriterId,
    ) -> Result<WriteOutcome> {
        Err(HearthError::ArtifactBackend("connection refused".to_string()))
    }

    async fn prune_below(&self, _session: &SessionKey, _tag: &str, _min_version: u64) -> Result<usize> {
        Ok(0)
    }
}

/// Turn store that panics when a turn is rewritten
struct PanickingTurns {
    inner: InMemoryTurnPersistence,
}

#[async_trait]
impl TurnPersistence for PanickingTurns {
    async fn replace_text(&self, turn: &TurnRef, _text: &str) -> Result<()> {
        panic!("turn {} is locked", turn);
    }

    async fn flush_partial(&self, turn: &TurnRef, text: &str) -> Result<()> {
        self.inner.flush_partial(turn, text).await
    }

    async fn finalize(&self, report: &FinalizeReport<'_>) -> Result<()> {
        self.inner.finalize(report).await
    }
}

#[tokio::test]
async fn test_backend_failure_ends_run_as_error() {
    let store = PersistedArtifactStore::new(Arc::new(UnreachableBackend), RetentionPolicy::KeepAll);
    let harness = Harness::with_store(
        ScriptedLlmClient::from_text("never"),
        Arc::new(MiniJinjaRenderer::new()),
        store,
    );

    let outcome = harness.run(request("unreachable", Vec::new())).await;

    assert_eq!(outcome.status, FinishedStatus::Error);
    assert_eq!(outcome.failed_type, None);
    assert!(outcome.message.as_deref().unwrap().contains("connection refused"));
    assert_eq!(
        outcome.state.phase(RunPhase::PrepareRunContext).unwrap().status,
        PhaseStatus::Failed
    );
    assert!(harness.llm.requests().is_empty());

    assert_eq!(harness.turns.finalized().len(), 1);
    assert_eq!(harness.turns.finalized()[0].status, FinishedStatus::Error);
    let names = harness.sink.names();
    assert_eq!(names.iter().filter(|n| **n == "run.finished").count(), 1);
}

#[tokio::test]
async fn test_panic_in_commit_ends_run_as_error() {
    let turns = Arc::new(PanickingTurns {
        inner: InMemoryTurnPersistence::new(),
    });
    let sink = Arc::new(CollectingEventSink::new());
    let runtime = GenerationRuntime::new(
        Arc::new(MiniJinjaRenderer::new()),
        Arc::new(ScriptedLlmClient::from_text("never")),
        turns.clone(),
    )
    .with_event_sink(sink.clone());

    let operations = vec![before(
        "canon",
        "{{ user_text }}!",
        OperationOutput::TurnCanonicalization {
            target: TurnTarget::User,
        },
    )];
    let outcome = runtime
        .run_chat_generation(request("panicky", operations))
        .await
        .unwrap();

    assert_eq!(outcome.status, FinishedStatus::Error);
    assert!(outcome.message.as_deref().unwrap().contains("is locked"));
    assert!(!sink.names().contains(&"main_llm.started"));
    assert_eq!(turns.inner.finalized().len(), 1);
    assert_eq!(sink.names().iter().filter(|n| **n == "run.finished").count(), 1);
    assert!(runtime.registry().is_empty());
}

#[tokio::test]
async fn test_partial_text_is_flushed_while_streaming() {
    let turns = Arc::new(InMemoryTurnPersistence::new());
    let llm = ScriptedLlmClient::from_text("one two three four five")
        .with_delay(Duration::from_millis(30));
    let settings = GenerationSettings {
        flush_interval_ms: 10,
        ..GenerationSettings::default()
    };
    let runtime = GenerationRuntime::new(Arc::new(MiniJinjaRenderer::new()), Arc::new(llm), turns.clone())
        .with_event_sink(Arc::new(CollectingEventSink::new()))
        .with_settings(settings);

    let outcome = runtime
        .run_chat_generation(request("flushing", Vec::new()))
        .await
        .unwrap();
    assert_eq!(outcome.status, FinishedStatus::Done);

    let flushes = turns.flushes();
    let partial: Vec<&String> = flushes
        .iter()
        .filter(|text| text.len() < outcome.state.assistant_text.len())
        .collect();
    assert!(partial.len() >= 2, "flushes: {:?}", flushes);
    assert!(partial.iter().all(|text| outcome.state.assistant_text.starts_with(text.as_str())));
    assert_eq!(flushes.last(), Some(&outcome.state.assistant_text));
}

#[tokio::test]
async fn test_failed_turn_rewrite_trips_required_barrier() {
    let turns = Arc::new(InMemoryTurnPersistence::failing_replace());
    let sink = Arc::new(CollectingEventSink::new());
    let llm = ScriptedLlmClient::from_text("never");
    let runtime = GenerationRuntime::new(Arc::new(MiniJinjaRenderer::new()), Arc::new(llm.clone()), turns.clone())
        .with_event_sink(sink.clone());

    let operations = vec![before(
        "canon",
        "{{ user_text | upper }}",
        OperationOutput::TurnCanonicalization {
            target: TurnTarget::User,
        },
    )
    .with_required(true)];
    let outcome = runtime
        .run_chat_generation(request("read-only", operations))
        .await
        .unwrap();

    let report = &outcome.state.commit_reports_by_hook[&Hook::BeforeMainLlm];
    assert_eq!(report.status, CommitStatus::Error);
    assert_eq!(report.effects[0].status, EffectCommitStatus::Error);
    assert!(report.effects[0].message.as_deref().unwrap().contains("read-only"));

    // The draft and user text keep their original values
    assert_eq!(outcome.state.user_text, "u");
    assert_eq!(outcome.state.effective_prompt_draft[1].content, "u");

    assert_eq!(outcome.status, FinishedStatus::Failed);
    assert_eq!(outcome.failed_type, Some(FailedType::BeforeBarrier));
    assert!(llm.requests().is_empty());
    assert!(sink.names().contains(&"commit.effect_error"));
}
