//! Preview engine: live previews of GitHub repositories on allocated ports.
//!
//! ## Overview
//!
//! A control request creates a run; the supervisor allocates a port and hands
//! the run to a pipeline that syncs the repository, picks the application
//! directory and its configuration, resolves the environment, builds, and
//! starts the app. The supervisor watches the result and answers status
//! queries; failed runs show their redacted error on the run's port.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, CORS, shutdown)        │
//! │ / GitHub │ <─────── │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘          │         │        └─ webhook.rs (HMAC, events)    │
//!                       │         v                                        │
//!                       │  supervisor.rs  (runs, attempts, exit watcher)   │
//!                       │    ├─ ports.rs        (PortPool)                 │
//!                       │    └─ placeholder.rs  (stub / error pages)       │
//!                       │         │                                        │
//!                       │         │ PreviewPipeline::launch()              │
//!                       │         v                                        │
//!                       │  pipeline.rs  (RealPipeline, StubPipeline)       │
//!                       │    ├─ git.rs             (clone / pull / reset)  │
//!                       │    ├─ candidates.rs      (app dir scoring)       │
//!                       │    ├─ project_config.rs  (preview.config.json)   │
//!                       │    ├─ env.rs             (env files, Supabase)   │
//!                       │    └─ executor.rs        (build, start, probe)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module           | Responsibility                                       |
//! |------------------|------------------------------------------------------|
//! | `command_safety` | Allow-list validation and sanitizing of commands     |
//! | `redact`         | Secret scrubbing for output, errors, and logs        |
//! | `output`         | Bounded output buffer and chunk types                |
//! | `manifest`       | `package.json` reading                               |
//! | `models`         | `Run`, `RunStatus`, request and response payloads    |
//! | `system`         | Process, filesystem, and clock seams plus fakes      |

pub mod api;
pub mod candidates;
pub mod command_safety;
pub mod env;
pub mod executor;
pub mod git;
pub mod manifest;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod placeholder;
pub mod ports;
pub mod project_config;
pub mod redact;
pub mod server;
pub mod supervisor;
pub mod system;
pub mod webhook;
