//! `vincent-core`: the state cache behind Vincent ability e2e runs.
//!
//! An e2e run needs funded accounts, a PKP, capacity credits, a registered
//! app version and a PKP permission for that version. Every one of those is an
//! on-chain side effect, so results are cached in `.e2e-state.json` and only
//! re-created when the cache cannot satisfy the request.
//!
//! ```text
//! StateManager ── load/save ──▶ StateStore (.e2e-state.json)
//!     │
//!     ├── accounts     get-or-generate keypairs per role
//!     ├── resources    get-or-mint PKP / capacity credits (expiry aware)
//!     ├── app          get-or-register app + version matching
//!     └── permission   PKP → app version permission ledger
//! ```
//!
//! Chain operations are never performed here; callers inject them as async
//! closures and the manager decides whether to call them.

pub mod account;
pub mod app;
pub mod clock;
pub mod config;
pub mod config_hash;
pub mod error;
pub mod io;
pub mod manager;
pub mod params;
pub mod paths;
pub mod permission;
pub mod resource;
pub mod state;

pub use config_hash::compute_config_hash;
pub use error::{E2eError, Result};
pub use manager::{Scope, StateManager};
