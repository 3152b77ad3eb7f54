//! Identity and access control plane.
//!
//! Users, groups and connectors authenticate with access keys; grants decide
//! what they may do; destinations pick up credentials minted on behalf of
//! users through a blocking rendezvous.

pub mod access;
pub mod config;
pub mod crypto;
pub mod data;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;
