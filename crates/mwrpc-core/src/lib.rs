//! mwrpc - client session layer for JSON RPC backends over a persistent
//! connection.
//!
//! The crate handles everything between "I have a URL" and "I got my result":
//! the connect handshake and login, correlation of concurrent calls over one
//! socket, cancellation and deadlines, transparent re-establishment of the
//! session after a drop, and the submit-then-poll protocol of long-running
//! jobs. What the methods mean is up to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use mwrpc::{Client, ClientOptions, Context, Credentials};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> mwrpc::Result<()> {
//!     let options = ClientOptions::new("wss://nas.local/api/current")
//!         .with_credentials(Credentials::api_key("1-abcdef"));
//!     let client = Client::connect(options).await?;
//!
//!     let ctx = Context::background().with_timeout(Duration::from_secs(10));
//!     let info = client.call(&ctx, "system.info", vec![]).await?;
//!     println!("{}", info);
//!
//!     // Long-running operations return a job id and are polled to completion.
//!     let ctx = Context::background();
//!     let pool = client
//!         .call_job(&ctx, "pool.create", vec![json!({"name": "tank"})])
//!         .await?;
//!     println!("created {}", pool);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod job;
pub mod session;
pub mod transport;

mod read_loop;
mod reconnect;

// Re-export commonly used types
pub use backoff::{retry_with_backoff, Backoff, BackoffConfig};
pub use client::Client;
pub use config::{ClientOptions, ProtocolConfig, TimeoutConfig};
pub use context::{Context, ContextError};
pub use dispatcher::{ConnectionState, Dispatcher};
pub use envelope::{Envelope, ErrorDescriptor, Notification};
pub use error::{ErrorCategory, Result, RpcError};
pub use job::{Job, JobProgress, JobRunner, JobState};
pub use session::{Credentials, SessionManager};
pub use transport::{Connection, Connector, DefaultConnector, Endpoint, TransportKind};
