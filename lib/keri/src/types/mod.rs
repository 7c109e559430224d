//! KERI data types

mod events;
mod messages;
mod outcome;
mod state;

pub use events::*;
pub use messages::*;
pub use outcome::*;
pub use state::*;
