//! SITH Core - Shadow/MarcDuino command engine
//!
//! This crate turns the short ASCII command frames used by Shadow and
//! MarcDuino astromech controllers into calls against an abstract hardware
//! layer, and plays timed panel sequences. It has no transport of its own;
//! a host feeds it bytes and drives its clock.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Hosts (daemon, tests)                          │
//! │   serial port │ unix socket │ in-process                           │
//! └──────────────────────┬───────────────────────────────────────────┘
//!                        │ bytes                ▲ OK / ERR replies
//! ┌──────────────────────┼──────────────────────┼─────────────────────┐
//! │                      ▼        SITH CORE     │                      │
//! │  ┌─────────────┐  ┌─────────┐  ┌────────────┴─┐  ┌──────────────┐ │
//! │  │   Frame     │─►│ Decoder │─►│  Dispatcher  │─►│ ConfigStore  │ │
//! │  │  Tokenizer  │  └─────────┘  └──────┬───────┘  └──────────────┘ │
//! │  └─────────────┘                      │                            │
//! │                     ┌─────────────────┤                            │
//! │                     ▼                 ▼                            │
//! │             ┌────────────────┐   ┌──────────┐                      │
//! │   tick ───► │ SequenceEngine │──►│   Hal    │ (logger │ sim)       │
//! │             └────────────────┘   └──────────┘                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`SithCore`]: owns one of everything and routes frames
//! - [`Command`]: a decoded frame
//! - [`Hal`]: capability traits implemented by hardware backends
//! - [`SequenceEngine`]: single-run sequence playback
//! - [`ConfigStore`]: checksummed persistent settings
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sith_core::{FrameTokenizer, LoggerBackend, SithCore};
//!
//! let hal = Arc::new(LoggerBackend::new());
//! let core = SithCore::with_hal(hal.clone());
//! let mut tokenizer = FrameTokenizer::new();
//!
//! for outcome in core.feed(&mut tokenizer, b":OP01\r:SE02\r") {
//!     println!("{}", outcome.reply());
//! }
//! core.tick(std::time::Duration::from_millis(500));
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: frame tokenizer, command model and decoder
//! - [`hal`]: hardware abstraction traits and the logger/sim backends
//! - [`sequence`]: sequence model, library, builtin catalogue and engine
//! - [`config`]: runtime configuration and the settings store
//! - [`dispatcher`]: command routing
//! - [`runtime`]: the assembled engine

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatcher;
pub mod hal;
pub mod protocol;
pub mod runtime;
pub mod sequence;

// Re-exports for convenience
pub use runtime::{FrameOutcome, SithCore, STARTUP_SOUND_BANK};
pub use dispatcher::{DispatchError, DispatchResult, Dispatcher};

// Protocol exports
pub use protocol::{
    decode, Argument, Command, Family, FrameTokenizer, NamedSound, Opcode, ProtocolError, Target,
    FRAME_TERMINATOR, MAX_FRAME_LEN,
};

// HAL exports
pub use hal::{
    Capability, Hal, HalCall, HalError, LoggerBackend, ServoPositions, SimBackend, SimState,
    SERVO_CLOSED_US, SERVO_MID_US, SERVO_OPEN_US,
};

// Sequence exports
pub use sequence::{
    CompletionNotice, CompletionReason, EngineError, EngineStatus, Position, RunAction, RunState,
    RunStatus, Sequence, SequenceBuilder, SequenceEngine, SequenceLibrary, SequenceRef,
    SequenceStep, TickReport,
};

// Config exports
pub use config::{
    default_config_path, default_runtime_dir, default_store_path, load_config,
    load_config_from_path, ConfigError, ConfigOverrides, ConfigSource, ConfigStorage,
    ConfigStore, ConfigStoreError, FileStorage, HalBackendKind, LoadOutcome, MemoryStorage,
    Setting, Settings, SithConfig, SithToml, SoundModule, TransportKind,
};
