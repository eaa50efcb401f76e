//! Handler contracts the adapter dispatches to.
//!
//! `variables` hold the path variable values most specific first, so a handler for
//! `/clusters/{clusterId}/nodes/{nodeId}` finds the node id at index zero.

use async_trait::async_trait;
use o2ims_core::{BoxStream, CancellationToken, O2Result, Object};
use o2ims_search::{Projector, Selector};

pub struct ListRequest {
    pub variables: Vec<String>,
    /// Also applied by the adapter; handlers may use it to narrow upstream queries.
    pub selector: Option<Selector>,
    pub projector: Projector,
    /// Decrypted marker from the previous page.
    pub next_page_marker: Option<Vec<u8>>,
}

pub struct ListResponse {
    pub items: BoxStream<Object>,
    /// Backend cursor for the following page, `None` on the last page.
    pub next_page_marker: Option<Vec<u8>>,
}

impl ListResponse {
    pub fn items(items: BoxStream<Object>) -> Self { Self { items, next_page_marker: None } }
}

pub struct GetRequest {
    pub variables: Vec<String>,
    pub projector: Projector,
}

pub struct GetResponse {
    pub object: Object,
}

pub struct AddRequest {
    pub variables: Vec<String>,
    pub object: Object,
}

pub struct AddResponse {
    pub object: Object,
}

/// PATCH merges `object` into the stored one; PUT (`replace`) swaps it whole.
pub struct UpdateRequest {
    pub variables: Vec<String>,
    pub object: Object,
    pub replace: bool,
}

pub struct UpdateResponse {
    pub object: Object,
}

pub struct DeleteRequest {
    pub variables: Vec<String>,
}

#[async_trait]
pub trait ListHandler: Send + Sync {
    async fn list(&self, ctx: &CancellationToken, req: ListRequest) -> O2Result<ListResponse>;
}

#[async_trait]
pub trait GetHandler: Send + Sync {
    /// Unknown objects are `O2Error::NotFound` (or `O2Error::End` from a drained stream).
    async fn get(&self, ctx: &CancellationToken, req: GetRequest) -> O2Result<GetResponse>;
}

#[async_trait]
pub trait AddHandler: Send + Sync {
    async fn add(&self, ctx: &CancellationToken, req: AddRequest) -> O2Result<AddResponse>;
}

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// A request that clashes with the object's state is `O2Error::Conflict`.
    async fn update(&self, ctx: &CancellationToken, req: UpdateRequest) -> O2Result<UpdateResponse>;
}

#[async_trait]
pub trait DeleteHandler: Send + Sync {
    async fn delete(&self, ctx: &CancellationToken, req: DeleteRequest) -> O2Result<()>;
}
