pub mod connection_registry;
pub mod message_router;

pub use connection_registry::ConnectionRegistry;
pub use message_router::MessageRouter;
