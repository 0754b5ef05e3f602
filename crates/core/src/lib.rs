pub mod config;
pub mod connection;
pub mod content_model;
pub mod driver;
pub mod events;
pub mod notify;
pub mod registry;
pub mod sql;
pub mod statement;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionManager, ConnectionState, Executed, Pending, QueryError};
pub use content_model::{ContentModelError, TableContentModel};
pub use events::{ConnectionEvent, EventStream};
