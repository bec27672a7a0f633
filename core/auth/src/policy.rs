//! Authentication states, the offline grace policy and the cold-start
//! state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use musichub_common::{Error, Result};

/// Session state as seen by the rest of the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    /// A credential exchange or cold-start check is in progress.
    Authenticating,
    /// The server confirmed the credentials during this run.
    AuthenticatedOnline,
    /// Cached credentials accepted without server contact.
    AuthenticatedOfflineGrace,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::AuthenticatedOnline => "authenticated_online",
            AuthState::AuthenticatedOfflineGrace => "authenticated_offline_grace",
        }
    }

    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            AuthState::AuthenticatedOnline | AuthState::AuthenticatedOfflineGrace
        )
    }
}

/// How long cached credentials stay usable without server contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineAuthPolicy {
    pub max_offline_days: u32,
}

impl OfflineAuthPolicy {
    pub const DEFAULT_MAX_OFFLINE_DAYS: u32 = 30;

    pub fn new(max_offline_days: u32) -> Self {
        Self { max_offline_days }
    }

    pub fn window(&self) -> Duration {
        Duration::days(i64::from(self.max_offline_days))
    }

    /// `now - last_auth <= window`. The boundary itself is still inside.
    pub fn within_grace(&self, last_auth: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(last_auth) <= self.window()
    }

    /// When offline access based on `last_auth` runs out.
    pub fn expires_at(&self, last_auth: DateTime<Utc>) -> DateTime<Utc> {
        last_auth + self.window()
    }
}

impl Default for OfflineAuthPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_OFFLINE_DAYS)
    }
}

/// Where cold start ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartOutcome {
    /// Credentials confirmed (or refreshed) by the server.
    Online,
    /// Cached credentials accepted within the grace window.
    OfflineGrace,
    /// No usable session; credentials are cleared.
    SignedOut,
}

impl ColdStartOutcome {
    pub fn state(self) -> AuthState {
        match self {
            ColdStartOutcome::Online => AuthState::AuthenticatedOnline,
            ColdStartOutcome::OfflineGrace => AuthState::AuthenticatedOfflineGrace,
            ColdStartOutcome::SignedOut => AuthState::Unauthenticated,
        }
    }
}

/// Inputs observed while deciding the cold-start state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartEvent {
    /// Persisted credentials were read.
    Loaded { has_credentials: bool, online: bool },
    TokenValid,
    /// The server rejected the access token.
    TokenRejected { has_refresh_token: bool },
    /// The validation request itself failed.
    ValidationFailed,
    RefreshSucceeded,
    RefreshFailed,
    GraceChecked { within_window: bool },
}

/// Phases of the cold-start decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartPhase {
    Loading,
    Validating,
    Refreshing,
    CheckingGrace,
    Finished(ColdStartOutcome),
}

impl ColdStartPhase {
    /// Advance on `event`.
    ///
    /// # Errors
    /// - `InvalidState` when `event` cannot occur in this phase
    pub fn next(self, event: ColdStartEvent) -> Result<Self> {
        use ColdStartEvent as E;
        use ColdStartOutcome as O;
        use ColdStartPhase as P;

        let next = match (self, event) {
            (P::Loading, E::Loaded { has_credentials: false, .. }) => P::Finished(O::SignedOut),
            (P::Loading, E::Loaded { online: true, .. }) => P::Validating,
            (P::Loading, E::Loaded { online: false, .. }) => P::CheckingGrace,

            (P::Validating, E::TokenValid) => P::Finished(O::Online),
            (P::Validating, E::TokenRejected { has_refresh_token: true }) => P::Refreshing,
            (P::Validating, E::TokenRejected { has_refresh_token: false }) => {
                P::Finished(O::SignedOut)
            }
            (P::Validating, E::ValidationFailed) => P::CheckingGrace,

            (P::Refreshing, E::RefreshSucceeded) => P::Finished(O::Online),
            (P::Refreshing, E::RefreshFailed) => P::Finished(O::SignedOut),

            (P::CheckingGrace, E::GraceChecked { within_window: true }) => {
                P::Finished(O::OfflineGrace)
            }
            (P::CheckingGrace, E::GraceChecked { within_window: false }) => {
                P::Finished(O::SignedOut)
            }

            (phase, event) => {
                return Err(Error::InvalidState(format!(
                    "Cold start cannot handle {:?} while {:?}",
                    event, phase
                )))
            }
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_grace_boundary() {
        let policy = OfflineAuthPolicy::default();
        assert!(policy.within_grace(now() - Duration::days(29), now()));
        assert!(policy.within_grace(now() - Duration::days(30), now()));
        assert!(!policy.within_grace(
            now() - Duration::days(30) - Duration::seconds(1),
            now()
        ));
    }

    #[test]
    fn test_no_credentials_signs_out_immediately() {
        let phase = ColdStartPhase::Loading
            .next(ColdStartEvent::Loaded {
                has_credentials: false,
                online: true,
            })
            .unwrap();
        assert_eq!(phase, ColdStartPhase::Finished(ColdStartOutcome::SignedOut));
    }

    #[test]
    fn test_online_rejected_token_refreshes() {
        let phase = ColdStartPhase::Loading
            .next(ColdStartEvent::Loaded {
                has_credentials: true,
                online: true,
            })
            .and_then(|p| p.next(ColdStartEvent::TokenRejected { has_refresh_token: true }))
            .and_then(|p| p.next(ColdStartEvent::RefreshSucceeded))
            .unwrap();
        assert_eq!(phase, ColdStartPhase::Finished(ColdStartOutcome::Online));
    }

    #[test]
    fn test_unreachable_server_falls_back_to_grace() {
        let phase = ColdStartPhase::Loading
            .next(ColdStartEvent::Loaded {
                has_credentials: true,
                online: true,
            })
            .and_then(|p| p.next(ColdStartEvent::ValidationFailed))
            .unwrap();
        assert_eq!(phase, ColdStartPhase::CheckingGrace);

        let phase = phase
            .next(ColdStartEvent::GraceChecked {
                within_window: true,
            })
            .unwrap();
        assert_eq!(phase, ColdStartPhase::Finished(ColdStartOutcome::OfflineGrace));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        assert!(ColdStartPhase::Loading
            .next(ColdStartEvent::RefreshSucceeded)
            .is_err());
        assert!(ColdStartPhase::Finished(ColdStartOutcome::Online)
            .next(ColdStartEvent::TokenValid)
            .is_err());
    }

    #[test]
    fn test_outcome_states() {
        assert!(ColdStartOutcome::OfflineGrace.state().is_authenticated());
        assert!(!ColdStartOutcome::SignedOut.state().is_authenticated());
    }
}
