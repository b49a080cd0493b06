#![allow(clippy::doc_markdown)] // Allow technical terms like AMR, EMS, FIFO in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # MES Core Rust
//!
//! Work order execution core for a manufacturing execution system.
//!
//! ## Overview
//!
//! A **work order** carries a unit of physical stock through a **step graph**
//! (a recipe or a scenario). Steps may run serially, fan out into parallel
//! equipment jobs, or wait on the completion of a named parallel branch. This
//! crate decides which steps are eligible at any instant, dispatches them to
//! external equipment through a [`StepExecutor`](orchestration::StepExecutor),
//! drives their lifecycle through a bounded retry/timeout policy, and allocates
//! pallets, locations and stock units without violating capacity invariants.
//!
//! ## Module Organization
//!
//! - [`models`] - work orders, step definitions, executions, pallets, locations, stock
//! - [`graph`] - step graph validation, predecessor resolution, condition expressions
//! - [`allocation`] - resource allocator with per-resource locking
//! - [`state_machine`] - step execution and work order state machines
//! - [`coordination`] - signal/join coordinator for wait steps
//! - [`orchestration`] - step discovery, scheduler, lifecycle controller, orchestrator
//! - [`persistence`] - store traits and the in-memory reference store
//! - [`events`] - audit sinks and the broadcast event publisher
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mes_core::config::MesConfig;
//! use mes_core::orchestration::{OrchestrationContext, Orchestrator};
//! use mes_core::persistence::InMemoryStore;
//!
//! # async fn example(executor: Arc<dyn mes_core::orchestration::StepExecutor>) -> mes_core::MesResult<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let context = OrchestrationContext::in_memory(store, executor, MesConfig::default());
//! let orchestrator = Arc::new(Orchestrator::new(context));
//! # let graph_id = uuid::Uuid::new_v4();
//! # let stock_id = uuid::Uuid::new_v4();
//!
//! let order = orchestrator.create_work_order(graph_id, stock_id, 50).await?;
//! orchestrator.start_work_order(order.id).await?;
//! let status = orchestrator.get_status(order.id).await?;
//! println!("{} is {} at {:.0}%", status.order_number, status.status, status.progress_percentage);
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod clock;
pub mod config;
pub mod constants;
pub mod coordination;
pub mod error;
pub mod events;
pub mod graph;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod scenarios;
pub mod state_machine;

pub use config::MesConfig;
pub use error::{MesError, MesResult};
pub use graph::StepGraph;
pub use orchestration::{OrchestrationContext, Orchestrator, StepExecutor, StepOutcome};
pub use state_machine::{ExecutionStatus, WorkOrderStatus};
