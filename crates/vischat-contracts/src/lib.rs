//! Data model and formats shared by the vischat engine and front ends.

pub mod chat;
pub mod conversation;
pub mod events;
pub mod models;
pub mod transcript;
pub mod wire;
