//! screen-lock-rule library entry point.
//!
//! A scoped fixture that installs a screen-lock PIN for one test, optionally
//! forces the user into post-lockdown strong auth, and always restores the
//! previous device state afterward.

pub mod config;
pub mod device;
pub mod error;
pub mod mock;
pub mod rule;
pub mod wait;

pub use config::{ConfigSource, RuleConfig};
pub use device::{
    Credential, CredentialStore, DeviceContext, DismissOutcome, InputDriver, KeyCode,
    KeyguardController, StrongAuthFlags, UserId, VerifyOutcome,
};
pub use error::FixtureError;
pub use mock::SimulatedDevice;
pub use rule::{BOUNCER_ESCALATION_ATTEMPT, ScreenLockRule, Snapshot};
pub use wait::{ConditionTimeout, WaitError, WaitPolicy, try_wait_until, wait_until};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

//
// ─── LOGGING ─────────────────────────────────────────────────────────────────
//

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default
/// `screen_lock_rule=info`).
///
/// Safe to call from every test; only the first call has any effect, and an
/// already-installed global subscriber is left alone.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("screen_lock_rule=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
