//! In-memory device implementing every capability trait.
//!
//! Always compiled so downstream harnesses can drive a [`crate::ScreenLockRule`]
//! without a real device. Asynchronous system behaviour is modelled with a
//! settle lag: a change made through one call becomes visible to polling reads
//! only after a configurable number of observations.

use anyhow::{Result, anyhow, bail};
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::trace;

use crate::device::{
    Credential, CredentialStore, DismissOutcome, InputDriver, KeyCode, KeyguardController,
    StrongAuthFlags, UserId, VerifyOutcome,
};

/// Consecutive wrong PINs after which verification is throttled.
pub const THROTTLE_AFTER_FAILURES: u32 = 5;
pub const THROTTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Value whose writes land after `lag` further observations.
#[derive(Debug, Clone, Copy)]
struct Lagged<T> {
    current: T,
    pending: Option<(T, u32)>,
}

impl<T: Copy + PartialEq> Lagged<T> {
    fn new(value: T) -> Self {
        Self {
            current: value,
            pending: None,
        }
    }

    fn set(&mut self, value: T, lag: u32) {
        // A repeated request for the value already in flight keeps its countdown.
        if matches!(self.pending, Some((v, _)) if v == value) {
            return;
        }
        if lag == 0 {
            self.current = value;
            self.pending = None;
        } else {
            self.pending = Some((value, lag));
        }
    }

    fn observe(&mut self) -> T {
        if let Some((value, remaining)) = self.pending.as_mut() {
            if *remaining == 0 {
                self.current = *value;
                self.pending = None;
            } else {
                *remaining -= 1;
            }
        }
        self.current
    }

    /// Value once every pending write has landed.
    fn settled(&self) -> T {
        self.pending.map_or(self.current, |(v, _)| v)
    }
}

#[derive(Debug)]
struct State {
    user: UserId,
    lag: u32,
    credential: Credential,
    secure: Lagged<bool>,
    lock_screen_disabled: Lagged<bool>,
    strong_auth: Lagged<StrongAuthFlags>,
    instant_lock: bool,
    screen_on: bool,
    keyguard_locked: Lagged<bool>,
    bouncer_shown: bool,
    awaiting_presence: bool,
    failed_attempts: u32,
    throttled: bool,
    key_presses: Vec<KeyCode>,
    wake_ups: u32,
    dismiss_requests: u32,
    fail_credential_clear: bool,
    stuck_secure: bool,
    disconnected: bool,
}

impl State {
    fn check_user(&self, user: UserId) -> Result<()> {
        if user != self.user {
            bail!("unknown user {user}");
        }
        Ok(())
    }
}

/// Configures a [`SimulatedDevice`].
#[derive(Debug, Clone)]
pub struct SimulatedDeviceBuilder {
    user: UserId,
    settle_after: u32,
    credential: Credential,
    screen_on: bool,
    keyguard_locked: bool,
    bouncer_shown: bool,
    instant_lock: bool,
    strong_auth: StrongAuthFlags,
}

impl Default for SimulatedDeviceBuilder {
    fn default() -> Self {
        Self {
            user: UserId(0),
            settle_after: 0,
            credential: Credential::None,
            screen_on: true,
            keyguard_locked: false,
            bouncer_shown: false,
            instant_lock: false,
            strong_auth: StrongAuthFlags::NOT_REQUIRED,
        }
    }
}

impl SimulatedDeviceBuilder {
    pub fn user(mut self, user: UserId) -> Self {
        self.user = user;
        self
    }

    /// Number of polling reads that still see the old value after a change.
    pub fn settle_after(mut self, observations: u32) -> Self {
        self.settle_after = observations;
        self
    }

    /// Start with a credential already installed (and the device secure).
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn screen_on(mut self, on: bool) -> Self {
        self.screen_on = on;
        self
    }

    pub fn keyguard_locked(mut self, locked: bool) -> Self {
        self.keyguard_locked = locked;
        self
    }

    pub fn bouncer_shown(mut self, shown: bool) -> Self {
        self.bouncer_shown = shown;
        self
    }

    pub fn instant_lock(mut self, enabled: bool) -> Self {
        self.instant_lock = enabled;
        self
    }

    pub fn strong_auth(mut self, flags: StrongAuthFlags) -> Self {
        self.strong_auth = flags;
        self
    }

    pub fn build(self) -> SimulatedDevice {
        let secure = !self.credential.is_none();
        SimulatedDevice {
            state: Mutex::new(State {
                user: self.user,
                lag: self.settle_after,
                credential: self.credential,
                secure: Lagged::new(secure),
                lock_screen_disabled: Lagged::new(false),
                strong_auth: Lagged::new(self.strong_auth),
                instant_lock: self.instant_lock,
                screen_on: self.screen_on,
                keyguard_locked: Lagged::new(self.keyguard_locked),
                bouncer_shown: self.bouncer_shown,
                awaiting_presence: false,
                failed_attempts: 0,
                throttled: false,
                key_presses: Vec::new(),
                wake_ups: 0,
                dismiss_requests: 0,
                fail_credential_clear: false,
                stuck_secure: false,
                disconnected: false,
            }),
        }
    }
}

/// Single-user simulated device. See the module docs.
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<State>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SimulatedDevice {
    pub fn builder() -> SimulatedDeviceBuilder {
        SimulatedDeviceBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Access state for a capability call, failing if the device is
    /// disconnected.
    fn with<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(anyhow!("device disconnected"));
        }
        f(&mut state)
    }

    // ─── Inspection (settled values, no lag) ────────────────────────────────

    pub fn credential(&self) -> Credential {
        self.lock().credential.clone()
    }

    pub fn secure(&self) -> bool {
        self.lock().secure.settled()
    }

    pub fn strong_auth(&self) -> StrongAuthFlags {
        self.lock().strong_auth.settled()
    }

    pub fn instant_lock(&self) -> bool {
        self.lock().instant_lock
    }

    pub fn lock_screen_disabled(&self) -> bool {
        self.lock().lock_screen_disabled.settled()
    }

    pub fn keyguard_locked(&self) -> bool {
        self.lock().keyguard_locked.settled()
    }

    pub fn screen_on(&self) -> bool {
        self.lock().screen_on
    }

    pub fn bouncer_shown(&self) -> bool {
        self.lock().bouncer_shown
    }

    pub fn key_presses(&self) -> Vec<KeyCode> {
        self.lock().key_presses.clone()
    }

    pub fn wake_ups(&self) -> u32 {
        self.lock().wake_ups
    }

    pub fn dismiss_requests(&self) -> u32 {
        self.lock().dismiss_requests
    }

    pub fn failed_attempts(&self) -> u32 {
        self.lock().failed_attempts
    }

    pub fn throttled(&self) -> bool {
        self.lock().throttled
    }

    // ─── Scripted events and fault injection ────────────────────────────────

    /// Turn the screen off and lock the keyguard, as a power-button press would.
    pub fn lock_now(&self) {
        let mut s = self.lock();
        s.screen_on = false;
        s.keyguard_locked.set(true, 0);
    }

    pub fn show_bouncer(&self) {
        self.lock().bouncer_shown = true;
    }

    /// Let the throttle timeout elapse so verification is accepted again.
    pub fn clear_throttle(&self) {
        self.lock().throttled = false;
    }

    /// Make clearing the credential report failure.
    pub fn set_fail_credential_clear(&self, fail: bool) {
        self.lock().fail_credential_clear = fail;
    }

    /// Keep reporting the device as secure after the credential is cleared.
    pub fn set_stuck_secure(&self, stuck: bool) {
        self.lock().stuck_secure = stuck;
    }

    /// Make every capability call fail with a transport error.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.lock().disconnected = disconnected;
    }
}

impl CredentialStore for SimulatedDevice {
    fn is_secure(&self, user: UserId) -> Result<bool> {
        self.with(|s| {
            s.check_user(user)?;
            Ok(s.secure.observe())
        })
    }

    fn set_credential(
        &self,
        new: &Credential,
        expected_old: &Credential,
        user: UserId,
    ) -> Result<bool> {
        self.with(|s| {
            s.check_user(user)?;
            if *expected_old != s.credential {
                trace!(%user, "set_credential rejected: old credential mismatch");
                return Ok(false);
            }
            if new.is_none() && s.fail_credential_clear {
                return Ok(false);
            }
            s.credential = new.clone();
            let lag = s.lag;
            let secure = !new.is_none() || s.stuck_secure;
            s.secure.set(secure, lag);
            if !new.is_none() {
                s.lock_screen_disabled.set(false, 0);
            }
            Ok(true)
        })
    }

    fn verify_credential(
        &self,
        credential: &Credential,
        user: UserId,
        _flags: u32,
    ) -> Result<VerifyOutcome> {
        self.with(|s| {
            s.check_user(user)?;
            // Rejected without checking, and without counting as a failure.
            if s.throttled {
                trace!(%user, "verify_credential rejected: throttled");
                return Ok(VerifyOutcome::Throttled {
                    retry_after: THROTTLE_TIMEOUT,
                });
            }
            if !s.credential.is_none() && *credential == s.credential {
                s.failed_attempts = 0;
                s.awaiting_presence = true;
                return Ok(VerifyOutcome::Matched);
            }
            s.failed_attempts += 1;
            if s.failed_attempts >= THROTTLE_AFTER_FAILURES {
                s.throttled = true;
                return Ok(VerifyOutcome::Throttled {
                    retry_after: THROTTLE_TIMEOUT,
                });
            }
            Ok(VerifyOutcome::Mismatch)
        })
    }

    fn set_lock_screen_disabled(&self, disabled: bool, user: UserId) -> Result<()> {
        self.with(|s| {
            s.check_user(user)?;
            let lag = s.lag;
            s.lock_screen_disabled.set(disabled, lag);
            Ok(())
        })
    }

    fn is_lock_screen_disabled(&self, user: UserId) -> Result<bool> {
        self.with(|s| {
            s.check_user(user)?;
            Ok(s.lock_screen_disabled.observe())
        })
    }

    fn get_strong_auth(&self, user: UserId) -> Result<StrongAuthFlags> {
        self.with(|s| {
            s.check_user(user)?;
            Ok(s.strong_auth.observe())
        })
    }

    /// Sets the flags exactly, so a previously read value can be restored.
    fn require_strong_auth(&self, flags: StrongAuthFlags, user: UserId) -> Result<()> {
        self.with(|s| {
            s.check_user(user)?;
            let lag = s.lag;
            s.strong_auth.set(flags, lag);
            Ok(())
        })
    }

    fn get_power_button_instant_lock(&self, user: UserId) -> Result<bool> {
        self.with(|s| {
            s.check_user(user)?;
            Ok(s.instant_lock)
        })
    }

    fn set_power_button_instant_lock(&self, enabled: bool, user: UserId) -> Result<()> {
        self.with(|s| {
            s.check_user(user)?;
            s.instant_lock = enabled;
            Ok(())
        })
    }

    fn mark_user_present(&self, user: UserId) -> Result<()> {
        self.with(|s| {
            s.check_user(user)?;
            if std::mem::take(&mut s.awaiting_presence) {
                let lag = s.lag;
                s.strong_auth.set(StrongAuthFlags::NOT_REQUIRED, lag);
            }
            Ok(())
        })
    }
}

impl KeyguardController for SimulatedDevice {
    fn is_keyguard_locked(&self) -> Result<bool> {
        self.with(|s| Ok(s.keyguard_locked.observe()))
    }

    fn dismiss_keyguard(&self) -> Result<DismissOutcome> {
        self.with(|s| {
            s.dismiss_requests += 1;
            if !s.screen_on || s.bouncer_shown {
                return Ok(DismissOutcome::Refused);
            }
            let lag = s.lag;
            s.keyguard_locked.set(false, lag);
            if s.keyguard_locked.settled() == s.keyguard_locked.current {
                Ok(DismissOutcome::Dismissed)
            } else {
                Ok(DismissOutcome::Pending)
            }
        })
    }
}

impl InputDriver for SimulatedDevice {
    fn is_screen_on(&self) -> Result<bool> {
        self.with(|s| Ok(s.screen_on))
    }

    fn wake_up(&self) -> Result<()> {
        self.with(|s| {
            s.screen_on = true;
            s.wake_ups += 1;
            Ok(())
        })
    }

    fn send_key(&self, key: KeyCode) -> Result<()> {
        self.with(|s| {
            trace!(code = key.code(), "key event");
            s.key_presses.push(key);
            if key == KeyCode::Back {
                s.bouncer_shown = false;
            }
            Ok(())
        })
    }
}
