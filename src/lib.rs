//! Roger Transport
//!
//! Real-time audio transport core: a lock-free byte ring between a producer
//! thread and a transport render callback, branch-free DSD/PCM staging
//! kernels, and a session state machine that reopens the transport safely
//! when the stream format changes.

pub mod audio;
pub mod config;
pub mod convert;
pub mod decode;
pub mod diag;
pub mod engine;
pub mod rt;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::SessionConfig;
pub use engine::{Engine, EngineConfig, EngineError, EngineSummary, Pacing};
pub use session::{ProducerHandle, SessionError, SessionState, TransportSession};
pub use transport::{CapabilitySet, RenderRequest, RenderSource, Transport, TransportError};
