//! Client session: connection, room membership, master/follower roles

mod handlers;
mod publisher;
#[allow(clippy::module_inception)]
mod session;
mod state;
mod types;

pub use session::{Session, SessionConfig};
pub use types::{RoomView, SessionError, SessionEvents, SyncStatus};
