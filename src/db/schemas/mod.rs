//! Database schemas for portico
//!
//! MongoDB document structures for API keys, host instances, pages and sessions.

mod api_key;
mod host_instance;
mod metadata;
mod page;
mod session;

pub use api_key::{hash_api_key, ApiKeyDoc, API_KEY_COLLECTION};
pub use host_instance::{HostInstanceDoc, HostStatus, HOST_INSTANCE_COLLECTION};
pub use metadata::Metadata;
pub use page::{PageDoc, PAGE_COLLECTION};
pub use session::{SessionDoc, SESSION_COLLECTION};
