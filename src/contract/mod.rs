//! The boundary between worker contexts and the interaction context.
//!
//! Workers propose trust anchors and emit diagnostics; the interaction
//! context owns the decision and the log sink.

mod context;
mod handlers;

pub use context::{ContextOptions, ContractClient, InteractionContext};
pub use handlers::{
    InstallDecision, InstallError, InstallHandler, InstallRequest, LogRecord, LogSink,
    PolicyInstaller, TracingLogSink,
};
