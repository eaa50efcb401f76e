//! O2IMS search: filter (selector) and field (projector) languages evaluated over
//! untyped JSON objects.
//!
//! Lookups never fail on absent data: a missing path is "no value", so optional and
//! extension fields can always appear in filters.

#![forbid(unsafe_code)]

pub mod evaluator;
pub mod path;
pub mod projector;
pub mod selector;

pub use evaluator::looks_like_uuid;
pub use path::{lookup, lookup_value, parse_paths, Path, Segment};
pub use projector::Projector;
pub use selector::{parse_selector, parse_selectors, Operator, Selector, Term};
