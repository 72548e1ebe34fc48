#![allow(clippy::missing_docs_in_private_items)]

pub mod convert;
pub mod processor;

pub use convert::ConversionDispatcher;
pub use processor::{DocumentProcessor, UNSUPPORTED_WORD_FORMAT_MESSAGE};
