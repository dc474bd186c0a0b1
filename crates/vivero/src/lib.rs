//! Vivero: appliance lifecycle pool service.
//!
//! Leases virtual appliances out of provider pools for UI test suites:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       VIVERO Architecture                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  RPC (axum) ──► PoolService ──► Store (rows + derived state)    │
//! │                     │  orders                                   │
//! │                     ▼                                           │
//! │  Workers: provisioner · fulfillment · reaper · reconcile        │
//! │           template scan · obsolete delete · mailer flush        │
//! │                     │                                           │
//! │                     ▼                                           │
//! │  ProviderClient (simulated or real virt/cloud backends)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A test suite asks for "2 preconfigured appliances of group cfme-59"
//! and polls `request_check` until the pool is fulfilled; quotas bound
//! what a single user may hold, and background control loops keep the
//! store reconciled with what the providers actually report.

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod rpc;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod workers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ProviderConfig, QuotaConfig, TemplateSeed, UserConfig, ViveroConfig, WorkerConfig};
pub use error::{QuotaKind, ViveroError, ViveroResult};
pub use models::{
    Appliance, AppliancePool, ApplianceId, DelayedProvisionTask, Group, MailerId,
    MismatchVersionMailer, PoolId, PowerState, Provider, ProvisionState, TaskId, Template,
    TemplateId, UserApplianceQuota,
};
pub use provider::{ProviderClient, ProviderDirectory, SimProvider};
pub use rpc::{router, RpcState};
pub use service::{Caller, PoolRequest, PoolService, ORDER_QUEUE_DEPTH};
pub use store::Store;
pub use workers::{LogNotifier, Notifier, WorkerOrder, Workers, DEFAULT_LEASE_MINUTES};
