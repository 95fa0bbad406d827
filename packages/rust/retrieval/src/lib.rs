//! Retrieval stage for ContentPipe.
//!
//! [`RetrievalAgent`] canonicalizes a URL, asks a [`Fetcher`] for its bytes
//! under a timeout, and turns them into [`contentpipe_shared::ProcessedContent`]
//! with the first [`ContentHandler`] that accepts them. [`HttpFetcher`] is the
//! default transport.

pub mod agent;
pub mod fetcher;
pub mod handlers;
pub mod http;
pub mod robots;

pub use agent::{FetchError, RetrievalAgent};
pub use fetcher::{Fetcher, FetcherError, RawResource};
pub use handlers::{ContentHandler, Extracted, HandlerError, HandlerRegistry};
pub use http::{HttpFetcher, USER_AGENT};
