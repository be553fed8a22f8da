//! Application state and composition.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use taverndb_shared::ServiceKind;

use crate::infrastructure::{
    app_settings::EngineSettings,
    clock::{SystemClock, SystemRandom},
    lane_queue::{LaneQueue, QueueOptions, TaskHandle, TaskOptions, DEFAULT_PRIORITY},
    memory_store::InMemoryKeyValueStore,
    ports::{ClockPort, KeyValueStore, RandomPort},
    retry::retry_with_backoff,
    session_repository::SessionRepository,
    sqlite_store::SqliteKeyValueStore,
};
use crate::use_cases::{CommandGuard, PipelineConfig, TurnOutcome, TurnPipeline};

/// Story turns jump ahead of background bookkeeping.
const STORY_PRIORITY: i32 = 1;

/// Main application state.
///
/// Owns the session store, the turn pipeline and the service queue. Service
/// calls go through `submit_turn`; everything else is read access.
pub struct App {
    pub settings: EngineSettings,
    pub sessions: SessionRepository,
    pub pipeline: Arc<TurnPipeline>,
    pub queue: LaneQueue,
    cancel: CancellationToken,
}

impl App {
    /// Wire the engine from settings: SQLite when a database path is set, memory otherwise.
    pub async fn new(settings: EngineSettings) -> anyhow::Result<Self> {
        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());
        let random: Arc<dyn RandomPort> = Arc::new(SystemRandom::new());

        let store: Arc<dyn KeyValueStore> = match &settings.db_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Using SQLite session store");
                Arc::new(SqliteKeyValueStore::new(&path.to_string_lossy(), clock.clone()).await?)
            }
            None => {
                tracing::info!("Using in-memory session store");
                Arc::new(InMemoryKeyValueStore::new())
            }
        };

        Ok(Self::with_ports(settings, store, clock, random))
    }

    /// Wire the engine around explicit ports.
    pub fn with_ports(
        settings: EngineSettings,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn ClockPort>,
        random: Arc<dyn RandomPort>,
    ) -> Self {
        let sessions = SessionRepository::new(store);
        let pipeline = Arc::new(TurnPipeline::new(
            sessions.clone(),
            CommandGuard::new(),
            clock,
            random,
            PipelineConfig::from_settings(&settings),
        ));

        // One call in flight per service lane
        let queue_options = [
            ServiceKind::Story,
            ServiceKind::Memory,
            ServiceKind::State,
            ServiceKind::Map,
        ]
        .into_iter()
        .fold(QueueOptions::new(settings.queue_max_concurrent), |options, service| {
            options.with_lane(service.lane(), 1)
        });

        Self {
            settings,
            sessions,
            pipeline,
            queue: LaneQueue::new(queue_options),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue one service turn: fetch the raw response with retries, then run the pipeline.
    ///
    /// `fetch` receives the 1-based attempt number.
    pub fn submit_turn<F, Fut>(
        &self,
        session_id: impl Into<String>,
        service: ServiceKind,
        fetch: F,
    ) -> TaskHandle<TurnOutcome>
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let session_id = session_id.into();
        let pipeline = self.pipeline.clone();
        let policy = self.settings.retry.clone();
        let cancel = self.cancel.clone();
        let priority = match service {
            ServiceKind::Story => STORY_PRIORITY,
            _ => DEFAULT_PRIORITY,
        };

        self.queue.enqueue(
            move || async move {
                let raw = retry_with_backoff(&policy, &cancel, fetch)
                    .await
                    .map_err(|e| anyhow::anyhow!("{} call failed: {}", service, e))?;
                let outcome = pipeline.run(&session_id, &raw, service).await?;
                Ok(outcome)
            },
            TaskOptions::lane(service.lane()).with_priority(priority),
        )
    }

    /// Abort pending retries and wait for queued turns to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down engine");
        self.cancel.cancel();
        self.queue.drain().await;
    }
}
