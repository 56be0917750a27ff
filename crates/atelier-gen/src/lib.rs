//! Atelier Generation Adapter
//!
//! Talks to the external, unreliable generation endpoint for one unit of
//! work at a time.
//!
//! # Components
//!
//! - [`GenerationBackend`]: one candidate model (see [`HttpBackend`])
//! - [`GenerationAdapter`]: ordered first-success fallback across backends,
//!   classification, and bounded fan-out for multi-part items
//! - [`parse_fragments`]: tolerant parser for interleaved text/image answers
//! - [`GenerationMode`]: how many outputs an analysed item will produce
//!
//! # Example
//!
//! ```rust,ignore
//! use atelier_gen::prelude::*;
//!
//! let adapter = GenerationAdapter::new(vec![primary, fallback]);
//! let analysis = adapter.analyze(&source).await?;
//! let plan = mode.plan(&analysis);
//! let generation = adapter.execute(&source, &mode, &plan, 3).await?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod adapter;
pub mod backend;
pub mod error;
pub mod http;
pub mod mode;
pub mod parser;
pub mod prompt;

pub use adapter::{Generation, GenerationAdapter, MAX_PART_CONCURRENCY};
pub use backend::{Candidate, Fragment, GenerationBackend, GenerationRequest, RawResponse, Task};
pub use error::{Attempt, BackendError, GenerationError, GenerationResult};
pub use http::HttpBackend;
pub use mode::{
    ExtractionScope, GarmentAnalysis, GarmentLayer, GarmentType, GenerationMode, GenerationPlan,
    Output, ScopeSelection,
};
pub use parser::{parse_analysis, parse_fragments, ParseResult};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the generation adapter
    pub use crate::{
        GarmentAnalysis, Generation, GenerationAdapter, GenerationBackend, GenerationError,
        GenerationMode, GenerationPlan, Output,
    };
}
