pub mod chunking;
pub mod config;
pub mod conversation;
pub mod error;
pub mod hashing;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod synthesis;
pub mod testing;

pub mod prelude {
    pub use crate::chunking::{ChatFragment, ConversationChunker};
    pub use crate::config::PipelineConfig;
    pub use crate::conversation::{Conversation, Message, Role};
    pub use crate::error::{Result, SynthError};
    pub use crate::llm::{Embedder, SummarizeOptions, Summarizer};
    pub use crate::memory::{FileGraphStore, GraphStore, InMemoryGraphStore, MemoryShard};
    pub use crate::pipeline::{
        PipelineOrchestrator, PipelineRegistry, ProgressSink, RunReport, RunState,
    };
}
