//! End-to-end flows through the coordinator with a scripted provider and a
//! recording transport. Timers run on paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use parley_core::errors::GatewayError;
use parley_core::events::{MessageRef, RawEvent};
use parley_core::history::ContentPart;
use parley_core::ids::ThreadId;
use parley_core::tokens::EstimatingCounter;
use parley_engine::testing::RecordingTransport;
use parley_engine::{
    CancelRegistry, Coordinator, DispatchConfig, Dispatcher, HistoryStore, IngestConfig, Pipeline,
    PipelineConfig, ToolExecutor, ToolRegistry,
};
use parley_llm::{build_slots, MockProvider, MockResponse, RotatingGateway, RotationConfig};
use parley_store::{Database, HistoryRepo};

struct Flow {
    coordinator: Arc<Coordinator>,
    provider: Arc<MockProvider>,
    gateway: Arc<RotatingGateway>,
    transport: Arc<RecordingTransport>,
}

fn flow(responses: Vec<MockResponse>, slots: usize) -> Flow {
    let provider = Arc::new(MockProvider::new(responses));
    let keys: Vec<String> = (0..slots).map(|i| format!("key-{i}")).collect();
    let gateway = Arc::new(RotatingGateway::new(
        provider.clone(),
        build_slots(&keys, &["model-a".to_string()]),
        RotationConfig::default(),
    ));
    let transport = Arc::new(RecordingTransport::new());
    let cancel = Arc::new(CancelRegistry::new());
    let history = Arc::new(HistoryStore::new(
        HistoryRepo::new(Database::in_memory().unwrap()),
        Arc::new(EstimatingCounter),
    ));
    let pipeline = Arc::new(Pipeline::new(
        gateway.clone(),
        history,
        Dispatcher::new(
            transport.clone(),
            cancel.clone(),
            DispatchConfig {
                send_pacing: Duration::from_millis(200),
            },
        ),
        ToolExecutor::new(Arc::new(ToolRegistry::new()), Duration::from_secs(5), 2_000),
        cancel.clone(),
        transport.clone(),
        PipelineConfig::default(),
    ));
    let coordinator = Coordinator::start(
        pipeline,
        cancel,
        transport.clone(),
        IngestConfig {
            debounce: Duration::from_millis(1_500),
            typing_refresh: Duration::from_secs(4),
            idle_evict_after: Duration::from_secs(60),
        },
        Duration::from_secs(30),
    );
    Flow {
        coordinator,
        provider,
        gateway,
        transport,
    }
}

fn text_event(thread: &str, msg_id: &str, text: &str) -> RawEvent {
    RawEvent {
        thread_id: ThreadId::from_raw(thread),
        message: MessageRef::new(msg_id),
        sender_id: "user-1".into(),
        sender_name: Some("Ana".into()),
        timestamp: Utc::now(),
        payload: json!({ "content": text }),
    }
}

fn last_user_text(provider: &MockProvider, call: usize) -> String {
    let request = &provider.requests()[call];
    let turn = request.turns.last().unwrap();
    turn.parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            ContentPart::Media { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_messages_gets_one_reply() {
    let f = flow(
        vec![
            MockResponse::chunked(&["[react:heart:1]", "[msg]Got all ", "three![/msg]"]),
            MockResponse::text("[msg]and the fourth[/msg]"),
        ],
        1,
    );

    f.coordinator.push(text_event("t1", "m1", "one"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    f.coordinator.push(text_event("t1", "m2", "two"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    f.coordinator.push(text_event("t1", "m3", "three"));
    settle().await;

    assert_eq!(f.provider.call_count(), 1);
    assert_eq!(last_user_text(&f.provider, 0), "one\ntwo\nthree");
    assert_eq!(f.transport.sent_texts(), vec!["Got all three!"]);
    assert!(f.transport.typing_count(&ThreadId::from_raw("t1")) >= 1);

    f.coordinator.push(text_event("t1", "m4", "four"));
    settle().await;
    assert_eq!(f.provider.call_count(), 2);
    assert_eq!(last_user_text(&f.provider, 1), "four");
    assert_eq!(
        f.transport.sent_texts(),
        vec!["Got all three!", "and the fourth"]
    );
}

#[tokio::test(start_paused = true)]
async fn new_message_preempts_running_generation() {
    let f = flow(
        vec![
            MockResponse::delayed(Duration::from_secs(20), MockResponse::text("[msg]stale[/msg]")),
            MockResponse::text("[msg]fresh[/msg]"),
        ],
        1,
    );

    f.coordinator.push(text_event("t1", "m1", "question"));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(f.coordinator.active_generations(), 1);

    f.coordinator.push(text_event("t1", "m2", "actually, never mind"));
    assert_eq!(f.coordinator.active_generations(), 0);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(f.transport.sent_texts(), vec!["fresh"]);
    assert_eq!(f.provider.call_count(), 2);
    // the first question is in history, the follow-up is the new user turn
    let second = &f.provider.requests()[1];
    assert_eq!(second.turns.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_slot_rotates_and_cools_down() {
    let f = flow(
        vec![
            MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
            MockResponse::text("[msg]from slot two[/msg]"),
        ],
        2,
    );

    f.coordinator.push(text_event("t1", "m1", "hello"));
    settle().await;

    assert_eq!(f.transport.sent_texts(), vec!["from slot two"]);
    assert_eq!(f.provider.slots_used(), vec!["model-a/0", "model-a/1"]);
    let slots = f.gateway.slots();
    assert!(slots[0].is_cooling(Utc::now()));
    assert!(!slots[1].is_cooling(Utc::now()));
}

#[tokio::test(start_paused = true)]
async fn exhausted_credentials_apologise_once() {
    let limited = || MockResponse::Error(GatewayError::RateLimited { retry_after: None });
    let f = flow(vec![limited(), limited()], 2);

    f.coordinator.push(text_event("t1", "m1", "hello"));
    settle().await;

    let sent = f.transport.sent_texts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("Sorry"));
}

#[tokio::test(start_paused = true)]
async fn threads_are_independent() {
    let f = flow(
        vec![
            MockResponse::text("[msg]for a[/msg]"),
            MockResponse::text("[msg]for b[/msg]"),
        ],
        1,
    );
    f.coordinator.push(text_event("a", "a1", "hi from a"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    f.coordinator.push(text_event("b", "b1", "hi from b"));
    settle().await;

    let mut sent = f.transport.sent_texts();
    sent.sort();
    assert_eq!(sent, vec!["for a", "for b"]);
}

#[tokio::test(start_paused = true)]
async fn clear_history_forgets_thread() {
    let f = flow(
        vec![
            MockResponse::text("[msg]noted[/msg]"),
            MockResponse::text("[msg]who?[/msg]"),
        ],
        1,
    );
    let thread = ThreadId::from_raw("t1");
    f.coordinator.push(text_event("t1", "m1", "my name is Ana"));
    settle().await;

    assert_eq!(f.coordinator.clear_history(&thread).unwrap(), 2);
    f.coordinator.push(text_event("t1", "m2", "what is my name?"));
    settle().await;

    assert_eq!(f.provider.requests()[1].turns.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_threads_are_swept() {
    let f = flow(vec![MockResponse::text("[msg]ok[/msg]")], 1);
    f.coordinator.push(text_event("t1", "m1", "hi"));
    settle().await;
    assert_eq!(f.coordinator.thread_count(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(f.coordinator.thread_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_and_stops() {
    let f = flow(
        vec![MockResponse::delayed(
            Duration::from_secs(60),
            MockResponse::text("[msg]never[/msg]"),
        )],
        1,
    );
    f.coordinator.push(text_event("t1", "m1", "hi"));
    tokio::time::sleep(Duration::from_secs(3)).await;

    f.coordinator.shutdown().await;
    assert!(f.coordinator.is_shut_down());
    assert_eq!(f.coordinator.active_generations(), 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(f.transport.sent_texts().is_empty());
    assert!(!f.coordinator.abort(&ThreadId::from_raw("t1")));
}
