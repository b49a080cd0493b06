// State machines for step executions and work orders.
//
// Both machines are pure: they validate a transition, run its guards and
// mutate the borrowed record. Callers persist the result and publish audit
// entries.

pub mod errors;
pub mod events;
pub mod guards;
pub mod states;
pub mod step_state_machine;
pub mod work_order_state_machine;

// Re-export main types for convenient access
pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use events::{SkipReason, StepEvent, WorkOrderEvent};
pub use guards::{StateGuard, WorkOrderGuardContext};
pub use states::{ExecutionStatus, WorkOrderStatus};
pub use step_state_machine::{timed_out, StepStateMachine};
pub use work_order_state_machine::WorkOrderStateMachine;
