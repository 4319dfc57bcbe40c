//! devdock dashboard back-end.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Browser  │ ───────> │  server.rs  (router, poller, proxy, shutdown)    │
//! │          │ <─────── │    ├─ api.rs  (handlers, AppState, envelope)     │
//! └──────────┘ WebSocket│    └─ ws.rs   (broadcast push channel)           │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  projects.rs  (ProjectManager lifecycle)         │
//!                       │    ├─ store.rs       (projects.json)             │
//!                       │    ├─ ports.rs       (host port allocation)      │
//!                       │    ├─ templates.rs   (compose, Dockerfile, .env) │
//!                       │    ├─ operations.rs  (tracked background ops)    │
//!                       │    └─ compose.rs     (docker compose client)     │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  executor.rs  (CommandExecutor trait)            │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! Side modules: `status.rs` (live probe and poller), `hosts.rs` (managed
//! hosts-file section), `proxy.rs` (Host-header reverse proxy),
//! `tunnel.rs` (ngrok), `env.rs` (.env editing) and `deps.rs`
//! (composer/npm manifests).

pub mod api;
pub mod compose;
pub mod deps;
pub mod env;
pub mod executor;
pub mod hosts;
pub mod models;
pub mod operations;
pub mod ports;
pub mod projects;
pub mod proxy;
pub mod server;
pub mod status;
pub mod store;
pub mod templates;
pub mod tunnel;
pub mod ws;
