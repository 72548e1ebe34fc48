#![allow(clippy::missing_docs_in_private_items)]

pub mod client;
pub mod poller;
pub mod service;

pub use client::RagClient;
pub use service::{KnowledgeBaseService, ProcessingQueue};
