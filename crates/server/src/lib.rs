//! HTTP servers for the silo storage pool.
//!
//! Hosts the Rivet retrieval protocol and the public redirect endpoint,
//! wired onto the content-addressing proxy. The S3-protocol front end is
//! an external collaborator that consumes `silo-proxy` directly.

pub mod auth;
pub mod backup;
pub mod error;
pub mod fetch;
pub mod guard;
pub mod redirect;
pub mod rivet;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use fetch::{Retriever, RivetResult, Temperature};
pub use routes::{redirect_router, rivet_router};
pub use state::AppState;
