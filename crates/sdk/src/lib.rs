//! durastream SDK
//!
//! Client-side access to a durable streams server: one-shot calls through
//! [`StreamClient`] and tail followers through [`StreamReader`] or
//! [`follow`].
//!
//! # Quick Start
//!
//! ## Writing and reading
//!
//! ```ignore
//! use durastream_sdk::{ClientConfig, CreateStream, StreamClient};
//!
//! let client = StreamClient::new(
//!     ClientConfig::new("https://streams.example.com").with_token(token),
//! );
//!
//! client.create("orders", CreateStream::content_type("application/json")).await?;
//! let appended = client.append("orders", r#"{"id":1}"#).await?;
//!
//! let batch = client.read("orders", None).await?;
//! assert_eq!(batch.next_offset, appended.next_offset);
//! ```
//!
//! ## Following a stream
//!
//! ```ignore
//! use durastream_sdk::{ClientConfig, FollowMode, StreamClient, StreamReader};
//!
//! let config = ClientConfig::new("https://streams.example.com")
//!     .with_reader_key("acme", reader_key)
//!     .with_follow(FollowMode::Sse);
//!
//! let mut reader = StreamReader::new(StreamClient::new(config), "orders", None);
//! let mut rx = reader.subscribe();
//! reader.connect().await?;
//!
//! while let Ok(batch) = rx.recv().await {
//!     for order in batch.json::<serde_json::Value>()? {
//!         println!("{order}");
//!     }
//! }
//! ```

pub mod client;
pub mod error;
pub mod reader;
pub mod types;

// Re-export main types at crate root
pub use client::StreamClient;
pub use error::{ClientError, Result};
pub use reader::{StreamReader, follow};
pub use types::{
    Appended, Batch, ClientConfig, ConnectionState, CreateStream, Credentials, DeliveryMode,
    FollowMode, Offset, SessionInfo, StreamInfo,
};
