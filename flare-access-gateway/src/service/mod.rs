pub mod bootstrap;

pub use bootstrap::{ApplicationBootstrap, ApplicationContext};
