//! HTTP handlers. Each one opens a request context, calls into the access
//! layer, and commits on success.

pub mod access_keys;
pub mod auth;
pub mod context;
pub mod credentials;
pub mod destinations;
pub mod grants;
pub mod groups;
pub mod organizations;
pub mod providers;
pub mod tokens;
pub mod users;

pub use context::{Deadline, HostOrg};
