//! Durable Streams Server
//!
//! A multi-tenant service of offset-addressed, append-only logs over HTTP.
//!
//! # Features
//!
//! - **Append-only streams**: one actor per stream serializes every write, so
//!   offsets are unique and strictly increasing
//! - **Replay support**: read from any offset to catch up on missed records
//! - **Long-polling and SSE**: wait for new records without busy polling
//! - **TTL/Expiration**: expired data is never served; recreation restarts at
//!   offset zero under a new epoch
//! - **Read collapsing**: identical concurrent reads share one backend call and
//!   are served from an edge cache until the next write
//! - **Fan-out sessions**: long-poll or push subscribers with bounded capacity
//!   and automatic reclamation
//! - **Projects**: per-tenant CORS, rotating signing keys and reader keys
//!
//! # Example
//!
//! ```rust,no_run
//! use durastream::{ServerOptions, start_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ServerOptions {
//!         port: 4437,
//!         host: "127.0.0.1".to_string(),
//!         ..Default::default()
//!     };
//!
//!     start_server(options).await.unwrap();
//! }
//! ```
//!
//! # Protocol
//!
//! ## Creating a stream
//!
//! ```text
//! PUT /v1/stream/my-events HTTP/1.1
//! Content-Type: application/json
//! Stream-TTL: 3600
//!
//! Response: 201 Created
//! Stream-Next-Offset: 0_0000000000000000
//! ```
//!
//! ## Appending data
//!
//! ```text
//! POST /v1/stream/my-events HTTP/1.1
//! Content-Type: application/json
//!
//! {"event": "user_created", "id": 123}
//!
//! Response: 200 OK
//! Stream-Offset: 0_0000000000000000
//! Stream-Next-Offset: 0_0000000000000001
//! ```
//!
//! ## Reading data
//!
//! ```text
//! GET /v1/stream/my-events?offset=-1 HTTP/1.1
//!
//! Response: 200 OK
//! Stream-Next-Offset: 0_0000000000000001
//! Stream-Up-To-Date: true
//! Stream-Cache: MISS
//! Content-Type: application/json
//!
//! [{"event": "user_created", "id": 123}]
//! ```
//!
//! ## Long-polling
//!
//! ```text
//! GET /v1/stream/my-events?offset=0_0000000000000001&live=long-poll&timeout_ms=30000 HTTP/1.1
//!
//! Response: 204 No Content (if no new data)
//! Stream-Up-To-Date: true
//! ```
//!
//! ## Subscribing
//!
//! ```text
//! POST /v1/subscribe/my-events?offset=-1 HTTP/1.1
//! Stream-Fanout-Mode: push
//! Stream-Fanout-Callback: https://example.com/hook
//!
//! Response: 201 Created
//! Stream-Fanout-Session-Id: 3f0c...
//! ```

pub mod actor;
pub mod auth;
pub mod bounded;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod publish;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod types;
pub mod validator;

// Re-export commonly used items
pub use cache::{CacheStatus, EdgeCache, MemoryEdgeCache, ReadCollapser, ReadFingerprint};
pub use config::ServerOptions;
pub use error::ApiError;
pub use manager::StreamManager;
pub use registry::{ProjectRegistry, ProjectSeed, Scope};
pub use server::{AppState, create_router, start_server};
pub use session::{HttpNotifier, Notifier, SessionManager};
pub use types::{CreateOptions, ReadFrom, ReadResult, StreamKey};
