//! Simulated spot exchange core: matching engine, account ledger,
//! notification fan-out, and a replay controller for strategy
//! back-testing, with no network transport of its own - REST/WS layers
//! are external collaborators that call into `ExchangeCore`.
//!
//! One top-level module per subsystem, `mod.rs`-per-directory.

pub mod auth;
pub mod config;
pub mod decimal;
pub mod error;
pub mod eventbus;
pub mod ledger;
pub mod matching;
pub mod models;
pub mod notifications;
pub mod orderbook;
pub mod replay;

use std::sync::Arc;

use crate::auth::AuthRegistry;
use crate::config::{EngineConfig, ReplayMode};
use crate::error::ReplayError;
use crate::eventbus::EventBus;
use crate::ledger::AccountManager;
use crate::matching::MatchingEngine;
use crate::notifications::NotificationFanout;
use crate::replay::{DataSource, ReplayController};

/// Top-level handle tying every subsystem together, with no
/// web-framework surface of its own: construct one per process and
/// hand `Arc<ExchangeCore>` clones to whatever REST/WS layer a caller
/// wires up around it.
pub struct ExchangeCore {
    pub engine: Arc<MatchingEngine>,
    pub ledger: Arc<AccountManager>,
    pub bus: Arc<EventBus>,
    pub fanout: Arc<NotificationFanout>,
    pub auth: Arc<AuthRegistry>,
    replay_mode: ReplayMode,
}

impl ExchangeCore {
    /// Builds the full subsystem graph and starts the event bus's
    /// dispatch workers. Must be called from within a running Tokio
    /// runtime (the dispatch workers are `tokio::spawn`ed here).
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let replay_mode = config.replay_mode;
        let bus = EventBus::new(config.event_bus.clone());
        bus.start();
        let fanout = Arc::new(NotificationFanout::new(Arc::clone(&bus)));
        let ledger = Arc::new(AccountManager::new());
        let engine = Arc::new(MatchingEngine::new(config, Arc::clone(&ledger), Arc::clone(&fanout)));
        let auth = Arc::new(AuthRegistry::new());

        tracing::info!("exchange core initialized");
        Arc::new(ExchangeCore { engine, ledger, bus, fanout, auth, replay_mode })
    }

    /// Builds a `ReplayController` over `sources`, wired to this
    /// instance's own event bus and configured `replay_mode`. Not built
    /// eagerly in `new` since a controller needs at least one data
    /// source to exist at all; call this once a caller has sources
    /// ready, then `tokio::spawn` the returned controller's `run()`.
    pub fn build_replay_controller(&self, sources: Vec<Arc<dyn DataSource>>) -> Result<Arc<ReplayController>, ReplayError> {
        Ok(Arc::new(ReplayController::new(sources, Arc::clone(&self.bus), self.replay_mode)?))
    }
}
