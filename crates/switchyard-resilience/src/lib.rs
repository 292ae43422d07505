pub mod breaker;
pub mod heartbeat;
pub mod retry;

pub use breaker::*;
pub use heartbeat::*;
pub use retry::*;
