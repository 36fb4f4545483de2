//! Trained-model persistence and the inspection/ranking HTTP API.

mod persistence;
mod server;

pub use persistence::{PersistenceError, SqliteModelStore};
pub use server::{serve, ServerError};
