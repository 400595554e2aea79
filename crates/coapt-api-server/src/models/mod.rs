pub mod chat;
pub mod search;
pub mod share;
