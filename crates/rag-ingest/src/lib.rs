pub mod docreader;
pub mod ingest;

pub use docreader::{DocChunk, DocReader, HttpDocReader, PlainTextDocReader, ReadConfig};
pub use ingest::KnowledgeIngestor;

pub use rag_error::{RagError, Result};
