//! # Orchestration Engine
//!
//! Drives work orders through their step graphs.
//!
//! ## Core Components
//!
//! - **ViableStepDiscovery**: classifies Pending steps whose predecessors are
//!   satisfied (dispatch, resolve in place, skip, or leave blocked)
//! - **ExecutionScheduler**: runs scheduler passes, allocates resources,
//!   dispatches to the [`StepExecutor`] and applies outcomes and the retry policy
//! - **WorkOrderFinalizer**: progress, completion, and the cooperative drain
//!   behind cancellation and failure
//! - **TimeoutSweeper**: finds in-flight attempts past their timeout
//! - **Orchestrator**: the public facade, single writer per work order
//!
//! Executors are external: the crate only defines the [`StepExecutor`]
//! contract and a [`SimulatedExecutor`] for development.

pub mod context;
pub mod lifecycle;
pub mod orchestrator;
pub mod scheduler;
pub mod step_executor;
pub mod timeout_sweeper;
pub mod types;
pub mod viable_step_discovery;

pub use context::OrchestrationContext;
pub use lifecycle::{progress_percentage, resolve_failure, WorkOrderFinalizer};
pub use orchestrator::Orchestrator;
pub use scheduler::ExecutionScheduler;
pub use step_executor::{
    ActionPayload, AssignedResource, DispatchError, DispatchRequest, SimulatedExecutor, StepExecutor,
    StepOutcome, TargetSystemRouter,
};
pub use timeout_sweeper::TimeoutSweeper;
pub use types::{
    AdvanceOutcome, CompletionMessage, FailureResolution, FinalizationAction, SchedulerPassResult,
    StepStatusReport, TimedOutStep, WorkOrderStatusReport,
};
pub use viable_step_discovery::{CandidateAction, ViableStep, ViableStepDiscovery};
