//! Watermark state and its optional SQLite persistence.

mod schema;
mod store;
mod types;
mod watermarks;

pub use schema::Database;
pub use store::WatermarkStore;
pub use types::DatabaseError;
