use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use parley_core::context::LlmRequest;
use parley_core::credentials::{ApiKey, CooldownStore, CredentialSlot};
use parley_core::errors::GatewayError;
use parley_core::provider::LlmProvider;
use parley_core::stream::ChunkStream;

/// Retry and cooldown tuning for the rotating gateway.
#[derive(Clone, Debug)]
pub struct RotationConfig {
    /// Cooldown applied to a slot when the provider gives no `retry_after`.
    pub cooldown: Duration,
    /// Same-slot retries for transient failures.
    pub max_transient_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_transient_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
        }
    }
}

/// Expand keys and models into the ordered slot list. Model-major: every
/// key is tried on the first model before any key moves to the next one.
pub fn build_slots(keys: &[String], models: &[String]) -> Vec<CredentialSlot> {
    models
        .iter()
        .flat_map(|model| {
            keys.iter().enumerate().map(move |(i, key)| {
                CredentialSlot::new(format!("{model}/{i}"), ApiKey::new(key.clone()), model.clone())
            })
        })
        .collect()
}

/// Point-in-time view of the gateway for operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub slots: usize,
    pub cooling: usize,
    pub cursor: usize,
    pub rotations: u64,
    pub retries: u64,
}

struct RotationState {
    slots: Vec<CredentialSlot>,
    cursor: usize,
}

/// Outcome of trying one slot (including its transient retries).
enum SlotAttempt {
    Streaming(ChunkStream),
    Failed(GatewayError),
}

/// Provider front-end that rotates across credential/model slots.
///
/// - Rate-limit and rejected-credential failures put the slot on cooldown
///   and move on to the next warm slot
/// - Transient failures retry the same slot with exponential backoff + jitter
/// - Fatal failures surface immediately
/// - The first chunk is awaited before returning; once a chunk has been
///   yielded the stream is committed and later errors surface as
///   `StreamInterrupted` with no rotation
pub struct RotatingGateway {
    provider: Arc<dyn LlmProvider>,
    state: Mutex<RotationState>,
    config: RotationConfig,
    cooldown_store: Option<Arc<dyn CooldownStore>>,
    total_rotations: AtomicU64,
    total_retries: AtomicU64,
}

impl RotatingGateway {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        slots: Vec<CredentialSlot>,
        config: RotationConfig,
    ) -> Self {
        Self {
            provider,
            state: Mutex::new(RotationState { slots, cursor: 0 }),
            config,
            cooldown_store: None,
            total_rotations: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    /// Attach durable cooldown state and restore any deadlines still in
    /// force. A failing store only loses persistence, never availability.
    pub fn with_cooldown_store(mut self, store: Arc<dyn CooldownStore>) -> Self {
        match store.load_cooldowns() {
            Ok(saved) => {
                let mut state = self.state.lock();
                let mut restored = 0usize;
                for slot in &mut state.slots {
                    if let Some(until) = saved.get(&slot.id) {
                        slot.cooldown_until = Some(*until);
                        restored += 1;
                    }
                }
                if restored > 0 {
                    info!(restored, "restored credential cooldowns");
                }
            }
            Err(e) => warn!(error = %e, "failed to load credential cooldowns"),
        }
        self.cooldown_store = Some(store);
        self
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Snapshot of the slots, including cooldown deadlines.
    pub fn slots(&self) -> Vec<CredentialSlot> {
        self.state.lock().slots.clone()
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    pub fn total_rotations(&self) -> u64 {
        self.total_rotations.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> GatewayStats {
        let now = Utc::now();
        let (slots, cooling, cursor) = {
            let state = self.state.lock();
            let cooling = state.slots.iter().filter(|s| s.is_cooling(now)).count();
            (state.slots.len(), cooling, state.cursor)
        };
        GatewayStats {
            slots,
            cooling,
            cursor,
            rotations: self.total_rotations(),
            retries: self.total_retries(),
        }
    }

    /// Start a generation, rotating across slots until one produces a first
    /// chunk. At most one attempt per slot.
    #[instrument(skip_all, fields(provider = self.provider.name()))]
    pub async fn generate(&self, request: &LlmRequest) -> Result<ChunkStream, GatewayError> {
        let max_attempts = self.slot_count();
        if max_attempts == 0 {
            return Err(GatewayError::NoCredentials);
        }

        let mut attempts = 0usize;
        loop {
            let (index, slot) = self.pick_slot(Utc::now());
            attempts += 1;

            let err = match self.attempt_slot(&slot, request).await {
                SlotAttempt::Streaming(stream) => {
                    debug!(slot = %slot.id, attempts, "generation started");
                    return Ok(stream);
                }
                SlotAttempt::Failed(e) => e,
            };

            if !err.is_rotatable() {
                if err.is_fatal() {
                    warn!(slot = %slot.id, error = %err, "provider refused request");
                }
                return Err(err);
            }

            self.mark_cooling(index, &slot.id, err.suggested_delay());
            if attempts >= max_attempts {
                warn!(attempts, error = %err, "all credential slots exhausted");
                return Err(GatewayError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            self.total_rotations.fetch_add(1, Ordering::Relaxed);
            warn!(
                slot = %slot.id,
                attempt = attempts,
                error_kind = err.error_kind(),
                "rotating to next credential slot"
            );
        }
    }

    /// First warm slot at or after the cursor. When every slot is cooling
    /// the cursor slot is used anyway.
    fn pick_slot(&self, now: DateTime<Utc>) -> (usize, CredentialSlot) {
        let mut state = self.state.lock();
        let n = state.slots.len();
        let start = state.cursor % n;
        let index = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| !state.slots[i].is_cooling(now))
            .unwrap_or(start);
        state.cursor = index;
        (index, state.slots[index].clone())
    }

    /// Put the slot on cooldown and advance the cursor past it, unless a
    /// concurrent failure already moved the cursor.
    fn mark_cooling(&self, index: usize, slot_id: &str, retry_after: Option<Duration>) {
        let cooldown = retry_after.unwrap_or(self.config.cooldown);
        let until = Utc::now()
            + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let until = {
            let mut state = self.state.lock();
            let n = state.slots.len();
            let slot = &mut state.slots[index];
            let until = slot.cooldown_until.map_or(until, |existing| existing.max(until));
            slot.cooldown_until = Some(until);
            if state.cursor == index {
                state.cursor = (index + 1) % n;
            }
            until
        };

        if let Some(store) = &self.cooldown_store {
            if let Err(e) = store.save_cooldown(slot_id, until) {
                warn!(slot = %slot_id, error = %e, "failed to persist cooldown");
            }
        }
    }

    /// One slot: connect, await the first chunk, retry transient failures.
    async fn attempt_slot(&self, slot: &CredentialSlot, request: &LlmRequest) -> SlotAttempt {
        let mut retry = 0u32;
        loop {
            let err = match self.open_stream(slot, request).await {
                Ok(stream) => return SlotAttempt::Streaming(stream),
                Err(e) => e,
            };

            // Nothing has been yielded yet, so an interrupted stream is
            // as safe to retry as a failed connect.
            let same_slot = err.is_transient() || matches!(err, GatewayError::StreamInterrupted(_));
            if !same_slot || retry >= self.config.max_transient_retries {
                return SlotAttempt::Failed(err);
            }

            let delay = self.retry_delay(retry);
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                slot = %slot.id,
                attempt = retry + 1,
                max_retries = self.config.max_transient_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            retry += 1;
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_stream(
        &self,
        slot: &CredentialSlot,
        request: &LlmRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let mut stream = self.provider.stream(slot, request).await?;
        match stream.next().await {
            Some(Ok(first)) => Ok(committed(first, stream)),
            Some(Err(e)) => Err(e),
            None => Ok(Box::pin(futures::stream::empty::<Result<String, GatewayError>>())),
        }
    }

    /// Exponential backoff: base * 2^attempt, capped, with +/- jitter.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Re-attach the first chunk and mark any later failure as interrupted.
fn committed(first: String, rest: ChunkStream) -> ChunkStream {
    let rest = rest.map(|item| {
        item.map_err(|e| match e {
            GatewayError::StreamInterrupted(_) | GatewayError::Cancelled => e,
            other => GatewayError::StreamInterrupted(other.to_string()),
        })
    });
    Box::pin(futures::stream::once(async move { Ok(first) }).chain(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};
    use std::collections::HashMap;

    use parley_core::errors::PersistenceError;
    use parley_core::stream::collect_text;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i}")).collect()
    }

    fn fast_config() -> RotationConfig {
        RotationConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn gateway(mock: Arc<MockProvider>, slots: usize) -> RotatingGateway {
        RotatingGateway::new(
            mock,
            build_slots(&keys(slots), &["m".to_string()]),
            fast_config(),
        )
    }

    fn rate_limited() -> MockResponse {
        MockResponse::Error(GatewayError::RateLimited { retry_after: None })
    }

    #[derive(Default)]
    struct MemoryCooldowns(Mutex<HashMap<String, DateTime<Utc>>>);

    impl CooldownStore for MemoryCooldowns {
        fn load_cooldowns(&self) -> Result<HashMap<String, DateTime<Utc>>, PersistenceError> {
            Ok(self.0.lock().clone())
        }
        fn save_cooldown(&self, slot_id: &str, until: DateTime<Utc>) -> Result<(), PersistenceError> {
            self.0.lock().insert(slot_id.to_string(), until);
            Ok(())
        }
    }

    #[test]
    fn slots_are_model_major() {
        let slots = build_slots(&keys(2), &["a".to_string(), "b".to_string()]);
        let ids: Vec<_> = slots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a/0", "a/1", "b/0", "b/1"]);
        assert_eq!(slots[2].model, "b");
    }

    #[tokio::test]
    async fn success_on_first_slot() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::chunked(&["hi", "!"])]));
        let gw = gateway(mock.clone(), 2);
        let stream = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "hi!");
        assert_eq!(gw.cursor(), 0);
        assert_eq!(gw.total_rotations(), 0);
    }

    #[tokio::test]
    async fn no_slots_is_fatal() {
        let mock = Arc::new(MockProvider::new(vec![]));
        let gw = gateway(mock.clone(), 0);
        let err = gw.generate(&LlmRequest::empty()).await.err().unwrap();
        assert!(matches!(err, GatewayError::NoCredentials));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn rotates_past_rate_limited_slot() {
        let mock = Arc::new(MockProvider::new(vec![
            rate_limited(),
            MockResponse::text("from slot two"),
        ]));
        let gw = gateway(mock.clone(), 3);

        let stream = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "from slot two");
        assert_eq!(mock.slots_used(), vec!["m/0", "m/1"]);

        let slots = gw.slots();
        assert!(slots[0].is_cooling(Utc::now()));
        assert!(!slots[1].is_cooling(Utc::now()));
        assert_eq!(gw.cursor(), 1);
    }

    #[tokio::test]
    async fn all_slots_rate_limited_is_exhausted() {
        let mock = Arc::new(MockProvider::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            MockResponse::text("never"),
        ]));
        let gw = gateway(mock.clone(), 3);

        let err = gw.generate(&LlmRequest::empty()).await.err().unwrap();
        match err {
            GatewayError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.is_rate_limit());
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 3);
        assert!(gw.slots().iter().all(|s| s.is_cooling(Utc::now())));
    }

    #[tokio::test]
    async fn cooling_slots_are_skipped_on_next_request() {
        let mock = Arc::new(MockProvider::new(vec![
            rate_limited(),
            MockResponse::text("one"),
            MockResponse::text("two"),
        ]));
        let gw = gateway(mock.clone(), 2);

        let _ = gw.generate(&LlmRequest::empty()).await.unwrap();
        let _ = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(mock.slots_used(), vec!["m/0", "m/1", "m/1"]);
    }

    #[tokio::test]
    async fn all_cooling_uses_cursor_slot() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text("anyway")]));
        let gw = gateway(mock.clone(), 2);
        {
            let mut state = gw.state.lock();
            let until = Utc::now() + chrono::Duration::seconds(30);
            for slot in &mut state.slots {
                slot.cooldown_until = Some(until);
            }
            state.cursor = 1;
        }
        let stream = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "anyway");
        assert_eq!(mock.slots_used(), vec!["m/1"]);
    }

    #[tokio::test]
    async fn retry_after_sets_cooldown_length() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::Error(GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(600)),
            }),
            MockResponse::text("ok"),
        ]));
        let gw = gateway(mock, 2);
        let _ = gw.generate(&LlmRequest::empty()).await.unwrap();

        let until = gw.slots()[0].cooldown_until.unwrap();
        assert!(until > Utc::now() + chrono::Duration::seconds(500));
    }

    #[tokio::test]
    async fn transient_error_retries_same_slot() {
        tokio::time::pause();
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::Error(GatewayError::ServerError {
                status: 500,
                body: "internal".into(),
            }),
            MockResponse::text("recovered"),
        ]));
        let gw = gateway(mock.clone(), 2);

        let stream = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "recovered");
        assert_eq!(mock.slots_used(), vec!["m/0", "m/0"]);
        assert_eq!(gw.total_retries(), 1);
        assert!(!gw.slots()[0].is_cooling(Utc::now()));
    }

    #[tokio::test]
    async fn transient_retries_are_bounded() {
        tokio::time::pause();
        let server_error = || {
            MockResponse::Error(GatewayError::ServerError {
                status: 502,
                body: "bad gateway".into(),
            })
        };
        let mock = Arc::new(MockProvider::new(vec![
            server_error(),
            server_error(),
            server_error(),
            MockResponse::text("unreached"),
        ]));
        let gw = gateway(mock.clone(), 2);

        let err = gw.generate(&LlmRequest::empty()).await.err().unwrap();
        assert_eq!(err.error_kind(), "server_error");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn fatal_error_not_retried_or_rotated() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::Error(GatewayError::InvalidRequest("bad body".into())),
            MockResponse::text("should not reach"),
        ]));
        let gw = gateway(mock.clone(), 3);

        let err = gw.generate(&LlmRequest::empty()).await.err().unwrap();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(mock.call_count(), 1);
        assert!(!gw.slots()[0].is_cooling(Utc::now()));
    }

    #[tokio::test]
    async fn error_before_first_chunk_rotates() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::Chunks(vec![Err(GatewayError::ProviderOverloaded)]),
            MockResponse::text("second"),
        ]));
        let gw = gateway(mock.clone(), 2);
        let stream = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "second");
        assert_eq!(mock.slots_used(), vec!["m/0", "m/1"]);
    }

    #[tokio::test]
    async fn error_after_first_chunk_is_interrupted_without_rotation() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::chunks_then_error(&["partial"], GatewayError::RateLimited { retry_after: None }),
            MockResponse::text("unreached"),
        ]));
        let gw = gateway(mock.clone(), 2);

        let mut stream = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::StreamInterrupted(_)));
        assert_eq!(mock.call_count(), 1);
        assert!(!gw.slots()[0].is_cooling(Utc::now()));
    }

    #[tokio::test]
    async fn concurrent_failures_advance_cursor_once() {
        let mock = Arc::new(MockProvider::new(vec![]));
        let gw = gateway(mock, 3);
        // Two requests both failed on slot 0; only the first moves the cursor.
        gw.mark_cooling(0, "m/0", None);
        gw.mark_cooling(0, "m/0", None);
        assert_eq!(gw.cursor(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_rate_limits_on_one_slot_skip_nothing() {
        let slow_limit = || MockResponse::delayed(Duration::from_millis(50), rate_limited());
        let mock = Arc::new(MockProvider::new(vec![
            slow_limit(),
            slow_limit(),
            slow_limit(),
            MockResponse::text("a"),
            MockResponse::text("b"),
            MockResponse::text("c"),
        ]));
        let gw = Arc::new(gateway(mock.clone(), 3));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let gw = gw.clone();
                tokio::spawn(async move {
                    let stream = gw.generate(&LlmRequest::empty()).await.unwrap();
                    collect_text(stream).await.unwrap()
                })
            })
            .collect();
        let mut texts = Vec::new();
        for task in tasks {
            texts.push(task.await.unwrap());
        }
        texts.sort();
        assert_eq!(texts, vec!["a", "b", "c"]);

        // All three failed on slot 0 but the cursor moved past it once, so
        // every retry landed on slot 1 and slot 2 was never touched.
        assert_eq!(gw.cursor(), 1);
        assert_eq!(mock.slots_used(), vec!["m/0", "m/0", "m/0", "m/1", "m/1", "m/1"]);
        let slots = gw.slots();
        assert!(slots[0].is_cooling(Utc::now()));
        assert!(!slots[1].is_cooling(Utc::now()));
        assert!(!slots[2].is_cooling(Utc::now()));
        assert_eq!(gw.total_rotations(), 3);
    }

    #[tokio::test]
    async fn stats_report_cooling_and_counters() {
        let mock = Arc::new(MockProvider::new(vec![
            rate_limited(),
            MockResponse::Error(GatewayError::ProviderOverloaded),
            MockResponse::text("ok"),
        ]));
        let gw = gateway(mock, 3);
        assert_eq!(
            gw.stats(),
            GatewayStats {
                slots: 3,
                cooling: 0,
                cursor: 0,
                rotations: 0,
                retries: 0,
            }
        );

        let _ = gw.generate(&LlmRequest::empty()).await.unwrap();
        let stats = gw.stats();
        assert_eq!(stats.cooling, 2);
        assert_eq!(stats.cursor, 2);
        assert_eq!(stats.rotations, 2);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cooling"], 2);
        assert!(json.get("rotations").is_some());
    }

    #[tokio::test]
    async fn cooldowns_persist_and_restore() {
        let store = Arc::new(MemoryCooldowns::default());
        let mock = Arc::new(MockProvider::new(vec![rate_limited(), MockResponse::text("ok")]));
        let gw = gateway(mock, 2).with_cooldown_store(store.clone());
        let _ = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert!(store.0.lock().contains_key("m/0"));

        // A fresh gateway over the same store starts with slot 0 cooling.
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text("restored")]));
        let gw = gateway(mock.clone(), 2).with_cooldown_store(store);
        assert!(gw.slots()[0].is_cooling(Utc::now()));
        let _ = gw.generate(&LlmRequest::empty()).await.unwrap();
        assert_eq!(mock.slots_used(), vec!["m/1"]);
    }

    #[test]
    fn retry_delay_is_capped() {
        let mock = Arc::new(MockProvider::new(vec![]));
        let gw = RotatingGateway::new(
            mock,
            vec![],
            RotationConfig {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(400),
                jitter_factor: 0.0,
                ..Default::default()
            },
        );
        assert_eq!(gw.retry_delay(0), Duration::from_millis(100));
        assert_eq!(gw.retry_delay(1), Duration::from_millis(200));
        assert_eq!(gw.retry_delay(5), Duration::from_millis(400));
    }
}
