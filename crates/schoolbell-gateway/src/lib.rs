//! # Schoolbell Gateway
//! HTTP API: trigger runs, browse the catalog, manage institution settings
//! and guardian channel preferences.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
