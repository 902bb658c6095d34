pub mod scoring;
pub mod session_id;
pub mod types;

pub use scoring::{ScoreInputs, cosine_similarity};
pub use session_id::{SessionId, SessionIdError};
pub use types::{Content, Embedding, ItemId, MemoryItem, Tier};
