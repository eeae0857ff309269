//! Request-admission and dispatch core for poolgate.
//!
//! Authenticates a caller, admits the request against user and account
//! concurrency budgets, picks an upstream account for the requested model,
//! forwards (streaming or unary) with the billing usage rewrite, fails over
//! across accounts on transient upstream errors, and records usage off the
//! request path.

pub mod auth;
pub mod billing;
pub mod bootstrap;
pub mod concurrency;
pub mod core;
pub mod emit;
pub mod errors;
pub mod forward;
pub mod gateway;
pub mod handler;
pub mod preflight;
pub mod recorder;
pub mod registry;
pub mod select;
pub mod sticky;
pub mod upstream_client;

pub use auth::{AuthProvider, AuthSnapshot, AuthSubject, MemoryAuth};
pub use concurrency::{calculate_max_wait, Scope, SlotController, SlotError, SlotPermit};
pub use self::core::{Core, CoreState};
pub use emit::{ClientEmitter, ResponseDecision};
pub use errors::ErrorKind;
pub use forward::{ForwardOutcome, ForwardResult};
pub use registry::{Account, Group, PoolRegistry};
pub use select::{Admission, Selection, WaitPlan};
pub use sticky::StickyStore;
