pub mod handler;
pub mod server;

pub use handler::OnlineHandler;
pub use server::OnlineStatusServer;
