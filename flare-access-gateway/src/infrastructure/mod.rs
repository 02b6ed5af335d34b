pub mod auth;
pub mod connection_table;
pub mod messaging;

pub use auth::JwtTokenValidator;
pub use connection_table::{ConnectionHandle, ConnectionTable};
pub use messaging::GrpcMessageForwarder;
