//! MusicHub session cache and offline authentication.
//!
//! Keeps the signed-in session usable across restarts and network outages:
//! - Persisted credentials under namespaced keys
//! - An offline grace window measured from the last server-confirmed login
//! - An explicit cold-start state machine
//! - Password, sign-up and OAuth provider sign-in against the auth API

pub mod api;
pub mod cache;
pub mod credentials;
pub mod policy;
pub mod provider;
pub mod session;
pub mod stub;

pub use api::{AuthApi, AuthResponse, HttpAuthApi, RefreshResponse};
pub use cache::{AuthConfig, AuthSnapshot, SessionCache};
pub use credentials::{CredentialStore, StoredCredentials};
pub use policy::{AuthState, ColdStartEvent, ColdStartOutcome, ColdStartPhase, OfflineAuthPolicy};
pub use provider::{OAuthProvider, ProviderAuthorization, ProviderConfig, ProviderGrant};
pub use session::{AuthUser, Session, UserRole};
pub use stub::StubAuthApi;
