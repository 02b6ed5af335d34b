mod connection;

pub use connection::{ClientType, Connection};
