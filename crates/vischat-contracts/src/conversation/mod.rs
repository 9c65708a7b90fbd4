mod buffer;
mod turn;

pub use buffer::{Conversation, RegeneratePlan};
pub use turn::{Role, Turn, TurnContent, TurnId, TurnUpdate};
