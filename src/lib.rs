//! XPath-driven structured extraction for XML and HTML documents
//!
//! Provides:
//! - Document loading (quick-xml for XML, scraper for HTML) into one queryable tree
//! - Default-namespace query rewriting
//! - A namespace-aware query engine with per-evaluation diagnostics
//! - A paginated extraction pipeline with `$variable` substitution between fields
//! - FFI interface exchanging JSON with a host

pub mod config;
pub mod document;
pub mod error;
pub mod ffi;
pub mod filter;
pub mod messages;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod serialize;

pub use config::{ExtractionContext, FieldSpec};
pub use document::{Dialect, NamespaceMap, ParsedDocument, Preprocessor, RawDocument};
pub use error::{ConfigError, ExtractionError, QueryDiagnostic, Result, Severity};
pub use filter::{FilterChain, NodeFilter};
pub use messages::{Message, MessageLevel, MessageLog, MessageSink, TracingSink};
pub use pipeline::{ExtractedRecord, ExtractionBatch, Extractor, FieldValue, Substitutions};
pub use progress::{MemoryProgressStore, PaginationState, ProgressStore};
pub use query::{EngineOptions, Evaluation, QueryEngine, QueryResult, QueryRewriter};
