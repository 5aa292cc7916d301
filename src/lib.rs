//! # tmux-orchestrator
//!
//! Secure deferred command scheduling for tmux-hosted AI agents.
//!
//! Requests to run a reminder later, or to type a message or whitelisted
//! command into a tmux window, pass through a fixed admission pipeline:
//!
//! ```text
//!   request
//!      │
//!      ▼
//!  ┌───────────┐   ┌─────────────┐   ┌──────────────────────┐
//!  │ Validator │──▶│ RateLimiter │──▶│ SchedulerBackend     │
//!  └───────────┘   └─────────────┘   │  at(1) | file poller │
//!        │                │          └──────────┬───────────┘
//!        ▼                ▼                     │ due
//!  ┌──────────────────────────────┐      ┌──────▼──────┐
//!  │           AuditLog           │◀─────│ Dispatcher  │
//!  └──────────────────────────────┘      └─────────────┘
//! ```
//!
//! ## Modules
//! - `config`: immutable configuration loaded once at startup
//! - `validation`: target, note, command and delay checks
//! - `rate_limit`: cross-process per-minute admission
//! - `store`: line-record task store for the polling backend
//! - `backend`: the `at` and polling backends behind one trait
//! - `dispatch`: the side effect of a firing task
//! - `scheduler`: the schedule / fire / cancel / expire entry points
//! - `messenger`: immediate message and command delivery
//! - `monitor`: read-only session, window and pane views
//! - `audit`: NDJSON audit trail

pub mod audit;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod messenger;
pub mod monitor;
pub mod rate_limit;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod tmux;
pub mod util;
pub mod validation;

pub use config::Config;
pub use error::Error;
pub use messenger::Messenger;
pub use monitor::Monitor;
pub use scheduler::Scheduler;
