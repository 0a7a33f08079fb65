//! Shared data model for Image Dasher: analysis results and the parser that
//! produces them, session history, the JSONL event log and the chat command
//! grammar.

pub mod analysis;
pub mod chat;
pub mod events;
pub mod session;
