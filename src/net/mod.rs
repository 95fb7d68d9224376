//! Network front end: wire events, subscriber fan-out, and the TCP
//! command/stream server.

pub mod broadcast;
pub mod event;
pub mod protocol;
pub mod server;

pub use broadcast::Broadcaster;
pub use event::Event;
pub use protocol::{Request, Response};
pub use server::{Server, ServerHandle};
