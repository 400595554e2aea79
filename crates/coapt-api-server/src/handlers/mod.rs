pub mod chat;
pub mod health;
pub mod properties;
pub mod search;
pub mod shares;
