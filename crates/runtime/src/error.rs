//! Error kinds shared with the variant runtime
//!
//! The stream core reports failures through the same taxonomy and
//! thread-local last-error channel as the variant runtime; stream-level
//! status flags live in `status`.

pub use vellum_core::error::*;
