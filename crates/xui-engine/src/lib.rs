//! x-ui Engine Crate
//!
//! Turns the panel's inbound database into a complete Xray configuration and
//! keeps a single Xray process running it.
//!
//! ## Features
//!
//! - **Client Filter**: Drops expired or over-quota clients from inbound settings
//! - **Config Synthesizer**: Template + enabled inbounds = engine config
//! - **Backend Injector**: Per-inbound forwarding outbounds and routing rules
//! - **Supervisor**: Restarts only when the synthesized config changed
//! - **Maintenance Loop**: Applies restart requests and revives a crashed engine
//!
//! ## Architecture
//!
//! ```text
//! InboundStore ─┐
//!               ├─> ConfigSynthesizer ─> inject_backend_routes ─> SynthesizedConfig
//! TemplateSource┘                                                        │
//!                                                                        ▼
//!                     run_maintenance ─> Supervisor ─ equals? ─> ProcessLauncher ─> xray
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod inject;
pub mod maintenance;
pub mod model;
pub mod process;
pub mod store;
pub mod supervisor;
pub mod synth;
pub mod template;
pub mod traffic;

pub use config::{InboundConfig, SynthesizedConfig, API_INBOUND_TAG};
pub use error::{EngineError, EngineResult, StoreError};
pub use filter::{filter_clients, filter_settings};
pub use inject::{backend_outbound_tag, inject_backend_routes};
pub use maintenance::{run_maintenance, MaintenanceIntervals};
pub use model::{BackendProtocol, ClientTraffic, InboundRecord, Protocol};
pub use process::{EngineProcess, EngineSettings, ProcessLauncher, XrayLauncher, XrayProcess};
pub use store::{InboundStore, JsonFileStore, MemoryStore};
pub use supervisor::{EngineState, Supervisor};
pub use synth::ConfigSynthesizer;
pub use template::{FileTemplate, StaticTemplate, TemplateSource, DEFAULT_TEMPLATE};
pub use traffic::{ClientTrafficSample, InboundTraffic, TrafficReport};
