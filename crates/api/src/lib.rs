//! O2IMS API: the generic HTTP adapter between O2IMS REST paths and pluggable handlers.
//!
//! Handlers implement any subset of list/get/add/update/delete. The adapter owns query parsing
//! (`filter`, `fields`, `exclude_fields`, `nextpage_opaque_marker`), selector and projector
//! application, next-page links, streaming and the problem+json error mapping.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod handlers;
pub mod link;
pub mod marker;
pub mod problem;

pub use adapter::{Adapter, AdapterConfig, AdapterRequest, MARKER_PARAM};
pub use handlers::{
    AddHandler, AddRequest, AddResponse, DeleteHandler, DeleteRequest, GetHandler, GetRequest, GetResponse,
    ListHandler, ListRequest, ListResponse, UpdateHandler, UpdateRequest, UpdateResponse,
};
pub use marker::{MarkerCipher, DEFAULT_MARKER_KEY};
pub use problem::{problem, status_of, Problem, PROBLEM_CONTENT_TYPE};
