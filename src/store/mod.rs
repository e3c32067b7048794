//! L0: local durable store — schema management and persistence.

pub mod models;
pub mod persistence;
pub mod schema;

pub use persistence::Persistence;
pub use schema::SchemaManager;
