//! Job orchestration back-end.
//!
//! ## Overview
//!
//! A job is one process run inside a scope's working directory: either a
//! shell command or a turn of the coding tool. The scope's files are
//! restored from object storage before launch and uploaded again after a
//! clean exit, so each job sees the previous job's changes.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, start_server)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘   SSE    │         │        sse.rs  (per-job event pump)    │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (Orchestrator facade)          │
//!                       │         │                                        │
//!                       │         │ JobRegistry::create()                  │
//!                       │         v                                        │
//!                       │  registry.rs  (status machine, live handles)     │
//!                       │         │                                        │
//!                       │         │ JobRunner::execute()                   │
//!                       │         v                                        │
//!                       │  runner.rs  ── sync::Synchronizer (materialize)  │
//!                       │         │   ── launcher.rs (spawn process)       │
//!                       │         │   ── multiplexer.rs (stdout/stderr)    │
//!                       │         │   ── sync::Synchronizer (persist)      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                           |
//! |-----------|----------------------------------------------------------|
//! | `models`  | Shared types: `Job`, `JobStatus`, `JobIntent`, `LogEntry` |
//! | `db`      | SQLite access via `DbHandle` (`spawn_blocking` wrapper)  |
//! | `events`  | `JobEvent`, the `EventBus` and per-job subscriptions     |
//!
//! ## Typical Flow (tool turn)
//!
//! 1. `POST /api/scopes/{scope_id}/turns` → `api::create_turn()`
//! 2. The job is stored as `pending` and the runner task is spawned.
//! 3. The runner restores the scope snapshot (or the template) into
//!    `<root>/<owner>/<scope>/<job>`, then launches the tool there.
//! 4. Stdout and stderr lines become log rows and events; JSON lines are
//!    classified into tool events for the `events` stream view.
//! 5. On exit the job turns `completed` or `failed`, the working
//!    directory is committed and zipped back to storage, and a final
//!    `complete` event closes the stream.

pub mod api;
pub mod db;
pub mod events;
pub mod launcher;
pub mod models;
pub mod multiplexer;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod server;
pub mod sse;
