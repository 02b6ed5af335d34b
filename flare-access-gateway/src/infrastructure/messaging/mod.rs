pub mod message_forwarder;

pub use message_forwarder::GrpcMessageForwarder;
