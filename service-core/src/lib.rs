//! service-core: shared infrastructure for the access control plane.
pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod subject;
pub mod uid;
pub mod utils;

pub use async_trait;
pub use axum;
pub use serde;
pub use serde_json;
pub use sqlx;
pub use tokio;
pub use tower;
pub use tower_http;
pub use tracing;
pub use validator;
