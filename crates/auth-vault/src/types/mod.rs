mod entry;
mod state_token;

pub use entry::{EntryStatus, TokenType, VaultEntry};
pub use state_token::StateToken;
