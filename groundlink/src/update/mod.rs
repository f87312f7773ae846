//! Self-update: manifest polling, resumable download, atomic binary swap.

pub mod requester;
pub mod service;
mod swap;

pub use requester::{
    ArtifactReader, HttpUpdateRequester, RangedUpdateRequester, UpdateFetchError, UpdateRequester,
    DEFAULT_CHUNK_SIZE,
};
pub use service::{
    UpdateService, UpdateServiceBuilder, UpdateServiceError, NO_UPDATE_AVAILABLE_EVENT,
    UPDATE_APPLIED_EVENT, UPDATE_AVAILABLE_EVENT, UPDATE_CHECK_FAILED_EVENT,
    UPDATE_DOWNLOADED_EVENT, UPDATE_DOWNLOAD_STARTED_EVENT,
};
pub use swap::SwapError;
