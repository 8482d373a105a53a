pub mod lexical;
pub mod vector;

pub use lexical::LexicalIndex;
pub use vector::{ChunkFilter, VectorIndex};
