//! # Host Bridge Traits
//!
//! Platform abstraction traits that the transfer core consumes.
//!
//! ## Overview
//!
//! This crate defines the contract between the transfer engine and the host
//! environment. Each trait represents a capability that the core requires but
//! that is implemented outside of it (on desktop by `bridge-desktop`, in tests
//! by fakes).
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP with buffered and streaming bodies
//!
//! ### Security & Storage
//! - [`SecureStore`](storage::SecureStore) - Credential cache persistence
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Host
//! implementations should:
//!
//! - Convert platform-specific errors to `BridgeError`
//! - Provide actionable error messages
//! - Include error context (e.g., file paths, URLs)
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds so a single implementation
//! can be shared by every transfer worker.
//!
//! ## Examples
//!
//! ### Implementing HttpClient
//!
//! ```ignore
//! use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, StreamingResponse};
//! use bridge_traits::error::Result;
//! use async_trait::async_trait;
//!
//! pub struct MyHttpClient {
//!     client: reqwest::Client,
//! }
//!
//! #[async_trait]
//! impl HttpClient for MyHttpClient {
//!     async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
//!         todo!()
//!     }
//!
//!     async fn execute_streaming(&self, request: HttpRequest) -> Result<StreamingResponse> {
//!         todo!()
//!     }
//! }
//! ```

pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{
    BodyStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, RequestBody, RetryPolicy,
    StreamingResponse,
};
pub use storage::SecureStore;
pub use time::{Clock, LogLevel, SystemClock};
