pub mod api;
pub mod catalog;
pub mod chunk;
pub mod core;
pub mod crawl;
pub mod discover;
pub mod fetch;
pub mod index;
pub mod nlp;
pub mod pipeline;
pub mod retrieve;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::{AppState, Config};

pub use catalog::normalize;
pub use catalog::UrlCatalog;
pub use chunk::{Chunker, ChunkerConfig};
pub use crawl::Crawler;
pub use discover::Orchestrator;
pub use index::{LexicalIndex, VectorIndex};
pub use pipeline::{QueueProcessor, Refresher};
pub use retrieve::RetrievalEngine;
