pub mod services;

pub use services::PresenceService;
