//! Remote data API collaborator: the request/response surface the engine
//! consumes, and the normalization boundary that narrows loose wire payloads
//! into engine types before they enter the store.

mod api;
mod api_types;

pub use api::{
  ApiError, MutationRequest, MutationResponse, PageRequest, PageResponse, RemoteApi,
};
pub use api_types::{
  normalize_item, normalize_items, ApiConversation, ApiItem, ApiMessage, ApiPost,
};
