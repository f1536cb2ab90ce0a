//! Capability traits the rule drives, and the small value types they share.
//!
//! Nothing here is looked up ambiently: a [`DeviceContext`] is built by the
//! harness and handed to [`crate::ScreenLockRule::new`].

use anyhow::Result;
use std::{fmt, sync::Arc, time::Duration};

/// Target user for every credential call. Fixed for the lifetime of a rule.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Lock-screen credential. `None` is the "no credential" sentinel.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    None,
    Pin(String),
}

impl Credential {
    pub fn pin(pin: impl Into<String>) -> Self {
        Self::Pin(pin.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

// Keep PIN digits out of logs and assertion output.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Credential::None"),
            Self::Pin(p) => write!(f, "Credential::Pin(<{} digits>)", p.len()),
        }
    }
}

/// Strong-auth requirement bits for a user.
///
/// Kept as a raw `u32` so a snapshot of whatever the device reported can be
/// written back unchanged, including bits this crate has no name for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StrongAuthFlags(pub u32);

impl StrongAuthFlags {
    pub const NOT_REQUIRED: Self = Self(0x0);
    pub const REQUIRED_AFTER_BOOT: Self = Self(0x1);
    pub const REQUIRED_AFTER_DPM_LOCK_NOW: Self = Self(0x2);
    pub const SOME_AUTH_REQUIRED_AFTER_USER_REQUEST: Self = Self(0x4);
    pub const REQUIRED_AFTER_LOCKOUT: Self = Self(0x8);
    pub const REQUIRED_AFTER_TIMEOUT: Self = Self(0x10);
    pub const REQUIRED_AFTER_USER_LOCKDOWN: Self = Self(0x20);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_required(self) -> bool {
        self != Self::NOT_REQUIRED
    }
}

impl fmt::Display for StrongAuthFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.bits())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyCode {
    Back,
}

impl KeyCode {
    /// Platform key code.
    pub fn code(self) -> u32 {
        match self {
            Self::Back => 4,
        }
    }
}

/// Result of submitting a credential for verification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Matched,
    Mismatch,
    /// Too many failures; the store will not check again until `retry_after`.
    Throttled { retry_after: Duration },
}

/// Synchronous acknowledgement of a keyguard dismiss request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DismissOutcome {
    Dismissed,
    /// Accepted, but the keyguard has not gone away yet.
    Pending,
    /// Dismissal is blocked (screen off, bouncer shown, ...).
    Refused,
}

/// Lock-credential store for a device.
pub trait CredentialStore: Send + Sync {
    fn is_secure(&self, user: UserId) -> Result<bool>;
    /// Replace `expected_old` with `new`. `Ok(false)` means the store refused,
    /// typically because `expected_old` did not match.
    fn set_credential(
        &self,
        new: &Credential,
        expected_old: &Credential,
        user: UserId,
    ) -> Result<bool>;
    fn verify_credential(
        &self,
        credential: &Credential,
        user: UserId,
        flags: u32,
    ) -> Result<VerifyOutcome>;
    fn set_lock_screen_disabled(&self, disabled: bool, user: UserId) -> Result<()>;
    fn is_lock_screen_disabled(&self, user: UserId) -> Result<bool>;
    fn get_strong_auth(&self, user: UserId) -> Result<StrongAuthFlags>;
    fn require_strong_auth(&self, flags: StrongAuthFlags, user: UserId) -> Result<()>;
    fn get_power_button_instant_lock(&self, user: UserId) -> Result<bool>;
    fn set_power_button_instant_lock(&self, enabled: bool, user: UserId) -> Result<()>;
    fn mark_user_present(&self, user: UserId) -> Result<()>;
}

/// Window manager's view of the keyguard.
pub trait KeyguardController: Send + Sync {
    fn is_keyguard_locked(&self) -> Result<bool>;
    fn dismiss_keyguard(&self) -> Result<DismissOutcome>;
}

/// UI automation driver.
pub trait InputDriver: Send + Sync {
    fn is_screen_on(&self) -> Result<bool>;
    fn wake_up(&self) -> Result<()>;
    fn send_key(&self, key: KeyCode) -> Result<()>;
}

/// Everything a rule needs to reach the device, injected explicitly.
#[derive(Clone)]
pub struct DeviceContext {
    pub user: UserId,
    pub credentials: Arc<dyn CredentialStore>,
    pub keyguard: Arc<dyn KeyguardController>,
    pub input: Arc<dyn InputDriver>,
}

impl DeviceContext {
    pub fn new(
        user: UserId,
        credentials: Arc<dyn CredentialStore>,
        keyguard: Arc<dyn KeyguardController>,
        input: Arc<dyn InputDriver>,
    ) -> Self {
        Self {
            user,
            credentials,
            keyguard,
            input,
        }
    }

    /// Wire a single backend implementing all three capabilities.
    pub fn from_backend<B>(backend: &Arc<B>, user: UserId) -> Self
    where
        B: CredentialStore + KeyguardController + InputDriver + 'static,
    {
        Self::new(user, backend.clone(), backend.clone(), backend.clone())
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
