pub mod chat;
pub mod chunk;
pub mod knowledge;
pub mod message;
pub mod model;
pub mod retriever;
pub mod session;
pub mod tenant;

pub use chat::{ChatMessage, ChatOptions, ChatResponse, ChatUsage, ResponseType, StreamResponse};
pub use chunk::{Chunk, ChunkType, ImageInfo};
pub use knowledge::{
    ChunkingConfig, Knowledge, KnowledgeBase, KnowledgeType, ObjectStorageConfig, ParseStatus,
};
pub use message::{Message, MessageRole, Reference, References};
pub use model::{EmbeddingParameters, Model, ModelParameters, ModelSource, ModelType};
pub use retriever::{
    IndexInfo, IndexParams, MatchType, RetrieveParams, RetrieveResult, RetrieverEngineParams,
    RetrieverEngineType, RetrieverType,
};
pub use session::{FallbackStrategy, Session, SummaryConfig};
pub use tenant::Tenant;

pub use rag_error::{RagError as Error, Result};
