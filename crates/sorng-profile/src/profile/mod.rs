//! Profile module root – re-exports public API surface.

pub mod types;
pub mod config;
pub mod events;
pub mod collaborators;
pub mod registry;
pub mod supervisor;
pub mod exec;
pub mod bundle;
pub mod device;
pub mod keyexchange;
pub mod auth;
pub mod scripts;
pub mod management;
pub mod classifier;
pub mod process;
pub mod wireguard;
pub mod health;
pub mod engine;
pub mod connection;

pub use types::*;
pub use config::{DaemonConfig, EngineConfig, ProfileSpec, TimingConfig, WgApplyMethod};
pub use connection::Profile;
pub use engine::Engine;
pub use events::{ChannelSink, Event, EventData, EventKind, EventSink, LogSink};
pub use registry::Registry;
pub use supervisor::{Supervisor, TaskFault};
