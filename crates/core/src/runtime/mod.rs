mod session;
mod shutdown;

pub use session::Runtime;
pub use shutdown::ShutdownGuard;
