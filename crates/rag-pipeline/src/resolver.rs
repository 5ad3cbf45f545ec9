pub use rag_llm::ModelResolver;
