// ai-writer-service/src/lib.rs

pub mod budget;
pub mod chat;
pub mod config;
pub mod error;
pub mod images;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod schema;

pub use budget::{BudgetLedger, BudgetPolicy, Clock, FixedClock, SystemClock};
pub use chat::{ChatClient, FakeChatClient, HttpChatClient, RawCompletion, TokenUsage};
pub use error::{ChatError, GenerationError, ImageError, Result, ValidationError};
pub use images::{FakeImageSearcher, ImageSearcher, PexelsClient};
pub use models::{
    BudgetSnapshot, DocSection, DocumentFormat, DocumentView, GenerationRequest, GenerationResult,
    HistoryEntry, HistoryFile, RequestedViews, Slide, TableView, ViewKind,
};
pub use persistence::{
    FileSink, HistoryLog, InMemoryStore, JsonFileStore, KeyValueStore, LocalFileSink,
};
pub use pipeline::{GenerationOutcome, GenerationPipeline, PipelineSettings, Stage};
