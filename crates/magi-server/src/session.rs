//! Session lifecycle: creation, cancellation, TTL cleanup and the bridge
//! from engine events to the broadcaster.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use magi::concurrency::ConcurrencyController;
use magi::config::Config;
use magi::consensus::ConsensusEngine;
use magi::error::MagiError;
use magi::events::{ErrorCode, Event, LogLevel};
use magi::models::{ConsensusPhase, PersonaType, UnitState};
use magi::streaming::{SendFn, StreamingEmitter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcaster::EventBroadcaster;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_SESSION_TIMEOUT_SECS: f64 = 120.0;
const MAX_SESSION_LOG_LINES: usize = 200;

fn default_timeout_sec() -> f64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub state: UnitState,
    pub message: String,
    pub score: f64,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            state: UnitState::Idle,
            message: String::new(),
            score: 0.0,
        }
    }
}

/// Observer-facing snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub phase: ConsensusPhase,
    pub progress: u8,
    pub units: BTreeMap<String, UnitStatus>,
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

struct SessionState {
    phase: ConsensusPhase,
    progress: u8,
    units: BTreeMap<String, UnitStatus>,
    logs: Vec<String>,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    cancel_requested: bool,
}

impl SessionState {
    fn new() -> Self {
        let units = PersonaType::ALL
            .iter()
            .map(|p| (p.display_name().to_string(), UnitStatus::default()))
            .collect();
        let now = Utc::now();
        Self {
            phase: ConsensusPhase::Queued,
            progress: 0,
            units,
            logs: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            cancel_requested: false,
        }
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::Phase { phase } => {
                self.phase = *phase;
            }
            Event::Progress { pct } => {
                self.progress = *pct;
            }
            Event::Unit {
                unit,
                state,
                message,
                score,
            } => {
                if let Some(status) = self.units.get_mut(unit) {
                    status.state = *state;
                    if let Some(message) = message {
                        status.message = message.clone();
                    }
                    if let Some(score) = score {
                        status.score = *score;
                    }
                }
            }
            Event::Log { lines, .. } => {
                self.logs.extend(lines.iter().cloned());
                if self.logs.len() > MAX_SESSION_LOG_LINES {
                    let overflow = self.logs.len() - MAX_SESSION_LOG_LINES;
                    self.logs.drain(..overflow);
                }
            }
            Event::Final { decision, .. } => {
                self.phase = ConsensusPhase::Resolved;
                self.progress = 100;
                self.logs.push(format!("Session resolved: {}", decision));
            }
            Event::Error { code, message } => {
                self.phase = ConsensusPhase::Error;
                self.logs.push(format!("Error ({:?}): {}", code, message));
            }
        }
    }
}

struct SessionHandle {
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
}

/// Builds an engine for one session. Injectable so tests can substitute
/// scripted providers.
pub type EngineFactory = Arc<
    dyn Fn(Config, Arc<StreamingEmitter>) -> magi::Result<ConsensusEngine> + Send + Sync,
>;

#[derive(Debug)]
pub enum CreateError {
    MaxConcurrency,
    Engine(MagiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Cancelling,
    Cancelled,
    AlreadyTerminal(ConsensusPhase),
}

pub struct SessionManager {
    base_config: Config,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    broadcaster: Arc<EventBroadcaster>,
    engine_factory: EngineFactory,
    max_concurrency: usize,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(
        base_config: Config,
        controller: Arc<ConcurrencyController>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Arc<Self> {
        let factory_controller = Arc::clone(&controller);
        let engine_factory: EngineFactory = Arc::new(move |config, emitter| {
            ConsensusEngine::new(config, Arc::clone(&factory_controller), emitter)
        });
        Self::with_engine_factory(base_config, broadcaster, engine_factory)
    }

    pub fn with_engine_factory(
        base_config: Config,
        broadcaster: Arc<EventBroadcaster>,
        engine_factory: EngineFactory,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            base_config,
            sessions: Mutex::new(HashMap::new()),
            broadcaster,
            engine_factory,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            ttl: DEFAULT_SESSION_TTL,
        });
        manager.clone().spawn_sweeper(DEFAULT_SWEEP_INTERVAL);
        manager
    }

    fn spawn_sweeper(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_expired().await;
            }
        });
    }

    async fn sweep_expired(&self) {
        let ttl = chrono::Duration::from_std(self.ttl).expect("ttl fits");
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, handle) in sessions.iter() {
            let state = handle.state.lock().await;
            if now - state.last_accessed_at > ttl {
                expired.push(id.clone());
            }
        }
        for id in expired {
            if let Some(handle) = sessions.remove(&id) {
                handle.cancel.cancel();
                self.broadcaster.close_session(&id).await;
                info!(session_id = %id, "session.expired");
            }
        }
    }

    /// Create a session and start its deliberation task. The returned
    /// WebSocket path is relative to the server root.
    pub async fn create(
        &self,
        prompt: String,
        options: SessionOptions,
    ) -> Result<(String, String), CreateError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_concurrency {
            return Err(CreateError::MaxConcurrency);
        }

        let session_id = Uuid::new_v4().to_string();
        let state = Arc::new(Mutex::new(SessionState::new()));
        let cancel = CancellationToken::new();

        // Engine events update session state, then fan out to observers.
        let broadcaster = Arc::clone(&self.broadcaster);
        let sink_state = Arc::clone(&state);
        let sink_session = session_id.clone();
        let send_fn: SendFn = Arc::new(move |event: Event| {
            let broadcaster = Arc::clone(&broadcaster);
            let state = Arc::clone(&sink_state);
            let session_id = sink_session.clone();
            Box::pin(async move {
                state.lock().await.apply(&event);
                broadcaster.publish(&session_id, event).await;
            })
        });

        let mut config = self.base_config.clone();
        if let Some(model) = &options.model {
            config.model = model.clone();
        }
        if let Some(rounds) = options.max_rounds {
            config.debate_rounds = rounds.max(1);
        }
        let emitter = Arc::new(StreamingEmitter::new(
            config.streaming_queue_size,
            config.streaming_overflow_policy,
            config.streaming_emit_timeout(),
            send_fn,
        ));

        let mut engine =
            (self.engine_factory)(config, Arc::clone(&emitter)).map_err(CreateError::Engine)?;

        let timeout = Duration::from_secs_f64(options.timeout_sec.max(0.001));
        let task_cancel = cancel.clone();
        let task_broadcaster = Arc::clone(&self.broadcaster);
        let task_state = Arc::clone(&state);
        let task_session = session_id.clone();
        let task_emitter = Arc::clone(&emitter);
        tokio::spawn(async move {
            let prompt = prompt;
            let outcome =
                tokio::time::timeout(timeout, engine.execute(&prompt, task_cancel)).await;
            match outcome {
                Ok(Ok(result)) => {
                    info!(
                        session_id = %task_session,
                        decision = %result.decision,
                        "session.resolved"
                    );
                }
                Ok(Err(MagiError::Cancelled)) => {
                    info!(session_id = %task_session, "session.cancelled");
                }
                Ok(Err(err)) => {
                    warn!(session_id = %task_session, error = %err, "session.failed");
                }
                Err(_) => {
                    // The engine future is dropped on deadline; permits are
                    // reclaimed as the in-flight tasks unwind. The emitter
                    // is closed here since the engine never got to do it.
                    task_emitter.close().await;
                    warn!(session_id = %task_session, "session.timeout");
                    {
                        let mut state = task_state.lock().await;
                        state.phase = ConsensusPhase::Error;
                    }
                    task_broadcaster
                        .publish(
                            &task_session,
                            Event::Error {
                                code: ErrorCode::Timeout,
                                message: format!(
                                    "session exceeded {:.0}s deadline",
                                    timeout.as_secs_f64()
                                ),
                            },
                        )
                        .await;
                }
            }
            task_broadcaster.close_session(&task_session).await;
        });

        sessions.insert(
            session_id.clone(),
            SessionHandle {
                state,
                cancel,
            },
        );
        info!(session_id = %session_id, "session.created");

        let ws_url = format!("/ws/sessions/{}", session_id);
        Ok((session_id, ws_url))
    }

    /// Request cancellation. Idempotent: a session already in a terminal
    /// phase reports that phase unchanged.
    pub async fn cancel(&self, session_id: &str) -> Option<CancelStatus> {
        let sessions = self.sessions.lock().await;
        let handle = sessions.get(session_id)?;
        let mut state = handle.state.lock().await;
        state.last_accessed_at = Utc::now();

        if state.phase.is_terminal() {
            return Some(match state.phase {
                ConsensusPhase::Cancelled => CancelStatus::Cancelled,
                phase => CancelStatus::AlreadyTerminal(phase),
            });
        }

        state.cancel_requested = true;
        state.logs.push("Cancellation requested.".to_string());
        handle.cancel.cancel();
        Some(CancelStatus::Cancelling)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        let handle = sessions.get(session_id)?;
        let mut state = handle.state.lock().await;
        state.last_accessed_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).expect("ttl fits");
        Some(SessionSnapshot {
            session_id: session_id.to_string(),
            phase: state.phase,
            progress: state.progress,
            units: state.units.clone(),
            logs: state.logs.clone(),
            created_at: state.created_at,
            expires_at: state.last_accessed_at + ttl,
            cancel_requested: state.cancel_requested,
        })
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Log a CRITICAL note when an observer disconnect forces cancellation;
    /// the MVP policy cancels the session to prevent runaway cost.
    pub async fn cancel_on_disconnect(&self, session_id: &str) {
        if let Some(status) = self.cancel(session_id).await {
            if status == CancelStatus::Cancelling {
                self.broadcaster
                    .publish(
                        session_id,
                        Event::Log {
                            level: LogLevel::Warn,
                            unit: None,
                            lines: vec![
                                "observer disconnected; cancelling session".to_string()
                            ],
                        },
                    )
                    .await;
            }
        }
    }
}
