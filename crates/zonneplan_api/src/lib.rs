//! Client for the Zonneplan app API.
//!
//! The API hands out loosely shaped JSON per contract type. Payloads are
//! kept as [`serde_json::Value`] and read through [`path`], while the
//! account structure that drives everything else is typed in [`types`].

pub mod auth;
pub mod client;
pub mod error;
pub mod path;
pub mod types;

pub use auth::AuthClient;
pub use auth::Session;
pub use auth::Token;
pub use auth::TokenStore;
pub use client::ApiClient;
pub use client::ClientConfig;
pub use client::Revalidate;
pub use error::ApiError;
pub use error::ApiResult;
pub use path::InstallIndex;
pub use path::PathError;
pub use path::ValuePath;
