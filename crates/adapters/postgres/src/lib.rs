//! relay-adapter-postgres - PostgreSQL 适配器

mod connection;
mod outbox;

pub use connection::*;
pub use outbox::*;
