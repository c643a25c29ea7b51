//! Services layer for identity-service.
//!
//! Provider configuration, principal resolution, group caching, sessions
//! and the flows built on top of them.

pub mod apply;
pub mod auth;
pub mod clock;
pub mod config_store;
pub mod error;
pub mod group_cache;
pub mod provider;
pub mod providers;
pub mod resolver;
pub mod store;
pub mod token;
pub mod users;

pub use apply::{ApplyOutcome, ApplyPipeline, ApplyState};
pub use auth::{AuthService, LoginRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config_store::ProviderConfigStore;
pub use error::{ErrorKind, IdentityError, IdentityResult};
pub use group_cache::GroupMembershipCache;
pub use provider::{
    AttributeMapping, AuthenticatedIdentity, FieldMapping, IdentityProvider, NativeRecord,
    PrincipalStream, ProviderRegistry,
};
pub use resolver::{retry_once, PrincipalResolver};
pub use store::{MemoryStore, ObjectStore, Versioned};
pub use token::{TokenManager, TokenPolicy, TokenRequest};
pub use users::UserService;
