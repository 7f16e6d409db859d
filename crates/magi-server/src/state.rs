use std::sync::Arc;

use magi::concurrency::ConcurrencyController;
use magi::config::Config;

use crate::broadcaster::EventBroadcaster;
use crate::session::{EngineFactory, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub broadcaster: Arc<EventBroadcaster>,
}

impl AppState {
    /// Production wiring: one process-wide concurrency controller shared by
    /// every engine this server creates.
    pub fn new(config: Config) -> Arc<Self> {
        let controller = Arc::new(ConcurrencyController::new(config.llm_concurrency_limit));
        let broadcaster = Arc::new(EventBroadcaster::default());
        let session_manager =
            SessionManager::new(config, controller, Arc::clone(&broadcaster));
        Arc::new(Self {
            session_manager,
            broadcaster,
        })
    }

    /// Test wiring with an injected engine factory.
    pub fn with_engine_factory(config: Config, engine_factory: EngineFactory) -> Arc<Self> {
        let broadcaster = Arc::new(EventBroadcaster::default());
        let session_manager = SessionManager::with_engine_factory(
            config,
            Arc::clone(&broadcaster),
            engine_factory,
        );
        Arc::new(Self {
            session_manager,
            broadcaster,
        })
    }
}
