//! The assembled runtime.
//!
//! One [`Runtime`] per injected process: the frame barrier with its clock,
//! entropy and optional checkpoint manager, plus the symbol resolver the
//! interception shims go through.

use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::alloc::ARENA;
use crate::barrier::{Crossing, FrameBarrier};
use crate::channel::{ChannelError, ControlSession};
use crate::checkpoint::{CheckpointManager, ImageIdentity, MappingsEngine};
use crate::clock::{FrameClock, Pacer};
use crate::config::{ConfigError, EngineKind, RuntimeConfig};
use crate::entropy::DeterministicEntropy;
use crate::symbols::SymbolResolver;
use crate::thread_state::{self, InheritedMode, OwnCodeGuard, THREADS};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct Runtime {
    config: RuntimeConfig,
    barrier: FrameBarrier,
    symbols: SymbolResolver,
}

impl Runtime {
    /// Build from a validated configuration.  Nothing is connected yet.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        if config.arena_limit > 0 {
            ARENA.set_limit(config.arena_limit);
        }

        let clock = FrameClock::new(
            config.fps_num,
            config.fps_den,
            config.initial_time_ns,
            config.time_query_threshold,
        );
        let pacer = Pacer::new(config.speed_divisor, config.fast_forward);
        let mut barrier = FrameBarrier::new(clock, DeterministicEntropy::new(config.seed), pacer);

        match config.checkpoint_engine {
            EngineKind::Mappings => {
                let manager = CheckpointManager::new(Box::new(MappingsEngine::new()), config.checkpoint_budget, &THREADS)
                    .with_suspend_timeout(Duration::from_millis(config.suspend_timeout_ms));
                info!("checkpoint engine: {}", manager.engine_name());
                barrier = barrier.with_checkpoints(manager);
            }
            EngineKind::Disabled => info!("checkpoints disabled"),
        }

        Ok(Self {
            config,
            barrier,
            symbols: SymbolResolver::default(),
        })
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn barrier(&self) -> &FrameBarrier {
        &self.barrier
    }

    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }

    /// Wait on the configured socket for the controller and serve it.
    pub fn connect(&self) -> Result<(), RuntimeError> {
        let session = ControlSession::accept(&self.config.socket_path)?;
        self.attach(session)
    }

    /// Serve an already established session.
    pub fn attach(&self, session: ControlSession) -> Result<(), RuntimeError> {
        let identity = ImageIdentity::current();
        self.barrier.attach(session, identity.exe)?;
        Ok(())
    }

    /// A frame is being presented by the calling thread.
    pub fn frame_boundary(&self) -> Crossing {
        let _own = OwnCodeGuard::new();
        let token = self.barrier.token();
        let crossing = self.barrier.cross(token);
        if crossing == Crossing::Terminated {
            warn!("session terminated at frame {}", self.barrier.frame());
        }
        crossing
    }
}

/// Mode the calling thread passes on to a thread it is creating.
pub fn spawn_mode() -> InheritedMode {
    thread_state::current().mode_for_child()
}

/// First call on a freshly created thread.
pub fn thread_started(mode: InheritedMode) {
    thread_state::current().apply_inherited(mode);
}

/// Last call on a thread before it exits.
pub fn thread_exiting() {
    thread_state::exiting();
}
