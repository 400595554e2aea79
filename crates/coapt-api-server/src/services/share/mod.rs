//! Shared sessions: read-only live views of a conversation for other people.

mod cache;
mod id;
mod mirror;
pub mod types;

pub use cache::{SessionCacheConfig, SharedSessionCache, ViewerHandle};
pub use id::{generate_share_id, SHARE_ID_BYTES};
pub use mirror::{connect_mirror, NoopMirror, RedisMirror, SessionMirror};
pub use types::{SessionSnapshot, SessionView, ShareError, VoteDirection, VoteTally, VoterTally};
