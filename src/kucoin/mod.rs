//! KuCoin spot exchange adapter
//!
//! - `auth`: request signing and credentials
//! - `types`: wire types for the REST API
//! - `client`: blocking client implementing `PriceSource` and `ExecutionAdapter`

pub mod auth;
pub mod client;
pub mod types;

pub use auth::Credentials;
pub use client::{timeframe_secs, KuCoinClient};
