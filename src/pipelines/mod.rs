//! C9 — ingestion pipelines.
//!
//! Each pipeline follows the same shape: fetch raw items from an injected
//! source trait, filter near-duplicates (C3), enrich with an LLM call (C4,
//! optionally grounded by a vector-store lookup of similar past events,
//! C2), persist, then dispatch (C6). A single malformed item never aborts
//! the batch — pipelines log and continue, matching the teacher's
//! `signals` ingest loop, which never lets one bad row stop the rest.

pub mod disclosure;
pub mod news;

pub use disclosure::{DisclosurePipeline, DisclosureSource, RawDisclosure};
pub use news::{NewsPipeline, NewsSource, RawNewsItem};
