pub mod error;
pub mod repositories;
pub mod session;

pub use error::GatewayError;
pub use repositories::{MessageForwarder, TokenValidator};
pub use session::SessionState;
