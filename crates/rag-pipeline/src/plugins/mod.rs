mod chat_stream;
mod embed_query;
mod into_chat_message;
mod merge;
mod persist;
mod preprocess;
mod rerank;
mod retrieve;
mod rewrite;

pub use chat_stream::PluginChatStream;
pub use embed_query::PluginEmbedQuery;
pub use into_chat_message::PluginIntoChatMessage;
pub use merge::PluginMergeResult;
pub use persist::PluginPersist;
pub use preprocess::PluginPreprocess;
pub use rerank::PluginRerank;
pub use retrieve::PluginRetrieve;
pub use rewrite::PluginRewriteQuery;
