//! Watch protocol: newline-delimited `{type, object}` envelopes turned into
//! a typed [`WatchStream`].

mod decoder;
mod event;
mod state;
mod stream;

pub use event::{ChangeEvent, EventType};
pub use state::WatchState;
pub use stream::WatchStream;
