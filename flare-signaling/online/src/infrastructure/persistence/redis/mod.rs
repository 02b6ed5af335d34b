mod repository;

pub use repository::RedisPresenceStore;
