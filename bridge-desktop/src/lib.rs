//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! This crate provides production-ready implementations of the bridge traits
//! the transfer core needs:
//! - `HttpClient` using `reqwest`, with streamed request and response bodies
//! - `SecureStore` backed by a private credential cache directory
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DirectorySecureStore, ReqwestHttpClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let secure_store = DirectorySecureStore::default_location()?;
//!
//!     // Use in transfer configuration
//! }
//! ```

mod http;
mod secure_store;

pub use http::ReqwestHttpClient;
pub use secure_store::DirectorySecureStore;
