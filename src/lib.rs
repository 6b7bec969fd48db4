//! Legacy-script execution bridge for a build/release automation agent.
//!
//! The bridge stages a sandbox for an external script-hosting process,
//! encodes the in-process execution context into a flat environment-variable
//! protocol, supervises the host's output and exit behavior, and converts
//! that behavior into a task result. It has no CLI surface — the surrounding
//! task-execution framework drives [`handler::LegacyScriptHandler`]
//! programmatically.

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod staging;
pub mod supervisor;

pub use config::AgentLayout;
pub use context::{
    CommandClassifier, Endpoint, EndpointAuthorization, ExecutionContext, OutputSink, TaskResult,
    Variables,
};
pub use error::{HandlerError, ProtocolError, StagingError, SupervisorError};
pub use handler::{HandlerState, LegacyScriptHandler, ScriptVariant, SetupPolicy};
pub use protocol::HostStatement;
pub use supervisor::{ProcessOutcome, ProcessSupervisor};
