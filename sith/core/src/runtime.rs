//! SITH runtime
//!
//! [`SithCore`] is the explicitly constructed object a host process holds:
//! one HAL backend, one sequence engine, one settings store and the
//! dispatcher that routes commands between them.
//!
//! # Design Philosophy
//!
//! The core knows nothing about where bytes come from. A host (the daemon,
//! a test, an emulator) owns one [`FrameTokenizer`] per connection and feeds
//! it through [`SithCore::feed`]; sequence playback advances on its own tick
//! via [`SithCore::run_ticker`]. Both paths are safe to drive concurrently.
//!
//! ```text
//!   transport ──bytes──► FrameTokenizer ──frame──► decode ──► Dispatcher
//!                                                               │
//!   run_ticker ──delta──► SequenceEngine ◄──────────────────────┤
//!                              │                                 │
//!                              └──────────► Hal ◄────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::config::{ConfigStore, FileStorage, HalBackendKind, SithConfig};
use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::hal::{Hal, HalCall, HalError, LoggerBackend, SimBackend};
use crate::protocol::{decode, Command, FrameTokenizer, ProtocolError};
use crate::sequence::{
    CompletionNotice, EngineError, SequenceEngine, SequenceLibrary, TickReport,
};

/// Sound bank holding the startup tracks selected by `#SS01`-`#SS03`
pub const STARTUP_SOUND_BANK: u8 = 1;

/// What happened to one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Decoded and dispatched
    Dispatched {
        /// The decoded command
        command: Command,
        /// Dispatch result
        result: DispatchResult,
    },
    /// Dropped before dispatch
    Rejected {
        /// Why the frame was dropped
        error: ProtocolError,
    },
}

impl FrameOutcome {
    /// Whether the frame was dispatched successfully
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Dispatched { result, .. } if result.is_success())
    }

    /// Reply line for the transport (without line ending)
    #[must_use]
    pub fn reply(&self) -> String {
        match self {
            Self::Dispatched { result, .. } => result.to_string(),
            Self::Rejected { error } => format!("ERR {error}"),
        }
    }
}

/// The protocol engine: dispatcher, sequence engine and settings store
pub struct SithCore {
    hal: Arc<dyn Hal>,
    engine: Arc<SequenceEngine>,
    store: Arc<ConfigStore>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for SithCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SithCore")
            .field("hal", &self.hal.name())
            .field("engine", &self.engine)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl SithCore {
    /// Assemble a core from its parts
    pub fn new(hal: Arc<dyn Hal>, library: SequenceLibrary, store: ConfigStore) -> Self {
        let engine = Arc::new(SequenceEngine::new(Arc::clone(&hal), library));
        let store = Arc::new(store);
        let dispatcher = Dispatcher::new(Arc::clone(&hal), Arc::clone(&engine), Arc::clone(&store));
        tracing::info!(backend = hal.name(), "SITH core ready");
        Self {
            hal,
            engine,
            store,
            dispatcher,
        }
    }

    /// Core over `hal` with the builtin sequences and in-memory settings
    pub fn with_hal(hal: Arc<dyn Hal>) -> Self {
        Self::new(hal, SequenceLibrary::with_builtins(), ConfigStore::in_memory())
    }

    /// Build a core from runtime configuration
    ///
    /// Selects the HAL backend, opens the settings file and loads user
    /// sequences.
    ///
    /// # Errors
    ///
    /// `Load` if the sequence directory cannot be read.
    pub fn from_config(config: &SithConfig) -> Result<Self, EngineError> {
        let hal: Arc<dyn Hal> = match config.hal_backend {
            HalBackendKind::Logger => Arc::new(LoggerBackend::new()),
            HalBackendKind::Sim => Arc::new(SimBackend::new()),
        };
        Self::from_config_with_hal(config, hal)
    }

    /// Like [`SithCore::from_config`] but over a caller-supplied backend
    ///
    /// # Errors
    ///
    /// `Load` if the sequence directory cannot be read.
    pub fn from_config_with_hal(
        config: &SithConfig,
        hal: Arc<dyn Hal>,
    ) -> Result<Self, EngineError> {
        let mut library = SequenceLibrary::with_builtins();
        if let Some(dir) = &config.sequences_dir {
            let loaded = library.load_dir(dir)?;
            tracing::info!(dir = %dir.display(), loaded, "Loaded user sequences");
        }
        let store = ConfigStore::load(FileStorage::new(&config.store_path));
        Ok(Self::new(hal, library, store))
    }

    /// HAL backend
    #[must_use]
    pub fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    /// Sequence engine
    #[must_use]
    pub fn engine(&self) -> &Arc<SequenceEngine> {
        &self.engine
    }

    /// Settings store
    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Dispatch an already decoded command
    pub fn dispatch(&self, command: &Command) -> DispatchResult {
        self.dispatcher.dispatch(command)
    }

    /// Decode and dispatch one frame (terminator already stripped)
    pub fn handle_frame(&self, frame: &[u8]) -> FrameOutcome {
        match decode(frame) {
            Ok(command) => {
                let result = self.dispatcher.dispatch(&command);
                FrameOutcome::Dispatched { command, result }
            }
            Err(error) => {
                tracing::warn!(frame = %String::from_utf8_lossy(frame), error = %error, "Frame rejected");
                FrameOutcome::Rejected { error }
            }
        }
    }

    /// Push transport bytes through `tokenizer` and handle every complete frame
    pub fn feed(&self, tokenizer: &mut FrameTokenizer, bytes: &[u8]) -> Vec<FrameOutcome> {
        tokenizer.push(bytes);
        let mut outcomes = Vec::new();
        while let Some(frame) = tokenizer.next_frame() {
            outcomes.push(match frame {
                Ok(frame) => self.handle_frame(&frame),
                Err(error) => {
                    tracing::warn!(error = %error, "Frame dropped");
                    FrameOutcome::Rejected { error }
                }
            });
        }
        outcomes
    }

    /// Advance sequence playback by `delta`
    pub fn tick(&self, delta: Duration) -> TickReport {
        self.engine.advance(delta)
    }

    /// Receive sequence completion notices
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionNotice> {
        self.engine.subscribe()
    }

    /// Tick the engine every `interval` until `shutdown` turns true
    ///
    /// Each tick passes the measured wall-clock delta, so a late tick catches
    /// up instead of drifting.
    pub async fn run_ticker(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();
        tracing::info!(interval_ms = interval.as_millis(), "Sequence ticker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let report = self.tick(now.duration_since(last));
                    last = now;
                    if !report.failures.is_empty() {
                        tracing::warn!(
                            failures = report.failures.len(),
                            "HAL failures during playback"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Sequence ticker stopped");
    }

    /// Play the configured startup sound unless quiet mode is on
    ///
    /// Returns `None` when nothing was played.
    pub fn startup(&self) -> Option<Result<(), HalError>> {
        let settings = self.store.snapshot();
        if settings.quiet_mode || settings.startup_sound == 0 {
            tracing::info!(
                quiet = settings.quiet_mode,
                startup_sound = settings.startup_sound,
                "Startup sound skipped"
            );
            return None;
        }
        let call = HalCall::SoundPlay {
            bank: STARTUP_SOUND_BANK,
            index: Some(settings.startup_sound),
        };
        tracing::info!(call = %call, "Playing startup sound");
        Some(call.apply(self.hal.as_ref()))
    }

    /// Stop playback, motion and sound
    ///
    /// Every step is attempted; failures are returned, not raised.
    pub fn emergency_stop(&self) -> Vec<HalError> {
        tracing::warn!("Emergency stop");
        if let Ok(notice) = self.engine.stop() {
            tracing::info!(sequence = %notice.sequence_name, "Sequence stopped by emergency stop");
        }
        [HalCall::MotorsStop, HalCall::DomeStop, HalCall::SoundStopAll]
            .iter()
            .filter_map(|call| call.apply(self.hal.as_ref()).err())
            .collect()
    }

    /// Health of the HAL backend
    #[must_use]
    pub fn health_check(&self) -> bool {
        self.hal.health_check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryStorage, Setting};
    use crate::protocol::MAX_FRAME_LEN;
    use crate::sequence::RunState;
    use pretty_assertions::assert_eq;

    fn logger_core() -> (Arc<LoggerBackend>, SithCore) {
        let hal = Arc::new(LoggerBackend::new());
        let core = SithCore::with_hal(hal.clone());
        (hal, core)
    }

    #[test]
    fn test_feed_handles_split_frames() {
        let (hal, core) = logger_core();
        let mut tokenizer = FrameTokenizer::new();
        assert!(core.feed(&mut tokenizer, b":OP").is_empty());
        let outcomes = core.feed(&mut tokenizer, b"01\r:CL");
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(
            hal.calls(),
            vec![HalCall::ServoSetPosition {
                channel: 1,
                pulse_us: 1000
            }]
        );
    }

    #[test]
    fn test_bad_frames_do_not_stop_processing() {
        let (hal, core) = logger_core();
        let mut tokenizer = FrameTokenizer::new();
        let long = vec![b'x'; MAX_FRAME_LEN + 5];
        let mut input = long;
        input.extend_from_slice(b"\r?junk\r:ZZ01\r:OP02\r");

        let outcomes = core.feed(&mut tokenizer, &input);
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(
            outcomes[0],
            FrameOutcome::Rejected {
                error: ProtocolError::FrameTooLong { .. }
            }
        ));
        assert!(matches!(
            outcomes[1],
            FrameOutcome::Rejected {
                error: ProtocolError::MalformedCommand { .. }
            }
        ));
        assert!(matches!(
            outcomes[2],
            FrameOutcome::Rejected {
                error: ProtocolError::UnknownOpcode { .. }
            }
        ));
        assert!(outcomes[3].is_success());
        assert_eq!(hal.calls().len(), 1);
    }

    #[test]
    fn test_reply_lines() {
        let (_hal, core) = logger_core();
        assert_eq!(core.handle_frame(b":OP01").reply(), "OK");
        assert!(core.handle_frame(b":SESTOP").reply().starts_with("ERR InvalidTransition"));
        assert!(core.handle_frame(b"").reply().starts_with("ERR MalformedCommand"));
    }

    #[test]
    fn test_startup_sound_respects_quiet_mode() {
        let (hal, core) = logger_core();
        assert_eq!(core.startup(), Some(Ok(())));
        assert_eq!(
            hal.take_calls(),
            vec![HalCall::SoundPlay {
                bank: STARTUP_SOUND_BANK,
                index: Some(1)
            }]
        );

        core.store().set(Setting::QuietMode(true)).unwrap();
        assert_eq!(core.startup(), None);
        assert!(hal.calls().is_empty());
    }

    #[test]
    fn test_silent_startup_sound() {
        let hal = Arc::new(LoggerBackend::new());
        let store = ConfigStore::load(MemoryStorage::new());
        store.set(Setting::StartupSound(0)).unwrap();
        let core = SithCore::new(hal.clone(), SequenceLibrary::empty(), store);
        assert_eq!(core.startup(), None);
    }

    #[test]
    fn test_emergency_stop_halts_sequence() {
        let (hal, core) = logger_core();
        core.handle_frame(b":SE02");
        hal.clear();

        assert!(core.emergency_stop().is_empty());
        assert_eq!(core.engine().status().state(), RunState::Stopped);
        assert_eq!(
            hal.take_calls(),
            vec![HalCall::MotorsStop, HalCall::DomeStop, HalCall::SoundStopAll]
        );
        assert!(core.tick(Duration::from_secs(5)).calls.is_empty());
    }

    #[test]
    fn test_from_config_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SithConfig::default();
        config.hal_backend = HalBackendKind::Sim;
        config.store_path = dir.path().join("settings.bin");
        let core = SithCore::from_config(&config).unwrap();
        assert_eq!(core.hal().name(), "sim");
        assert!(core.health_check());
    }

    #[tokio::test]
    async fn test_ticker_plays_sequence_to_completion() {
        let (_hal, core) = logger_core();
        let core = Arc::new(core);
        let mut notices = core.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        core.engine()
            .register(
                crate::sequence::SequenceBuilder::new(90, "blink")
                    .step(0, "open", [(1, crate::sequence::Position::Open)])
                    .step(20, "close", [(1, crate::sequence::Position::Closed)])
                    .build(),
            )
            .unwrap();
        core.handle_frame(b":SEblink");
        let ticker =
            tokio::spawn(Arc::clone(&core).run_ticker(Duration::from_millis(1), shutdown_rx));

        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.sequence_id, 90);
        assert_eq!(notice.steps_fired, 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), ticker)
            .await
            .unwrap()
            .unwrap();
    }
}
