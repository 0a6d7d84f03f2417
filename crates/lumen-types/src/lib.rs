mod event;
mod message;
mod provider;
mod quota;
mod session;

pub use event::*;
pub use message::*;
pub use provider::*;
pub use quota::*;
pub use session::*;
