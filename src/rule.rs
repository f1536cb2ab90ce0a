use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

use crate::{
    config::RuleConfig,
    device::{Credential, DeviceContext, KeyCode, StrongAuthFlags, UserId, VerifyOutcome},
    error::FixtureError,
    wait::{WaitError, WaitPolicy, try_wait_until},
};

/// Attempt (zero-based) from which keyguard dismissal also presses Back, in
/// case a bouncer raced onto the screen.
pub const BOUNCER_ESCALATION_ATTEMPT: u32 = 10;

/// Device settings captured by setup and written back by teardown.
///
/// Produced once by [`ScreenLockRule::setup`] and consumed by
/// [`ScreenLockRule::teardown`], so a snapshot cannot leak into a second test.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "pass the snapshot to ScreenLockRule::teardown"]
pub struct Snapshot {
    instant_lock_on_power: bool,
    strong_auth: StrongAuthFlags,
}

impl Snapshot {
    pub fn instant_lock_on_power(&self) -> bool {
        self.instant_lock_on_power
    }

    pub fn strong_auth(&self) -> StrongAuthFlags {
        self.strong_auth
    }
}

/// Sets a screen lock on the device for the duration of a test.
///
/// With [`RuleConfig::require_strong_auth`], the user starts the test in
/// post-lockdown strong auth: trust agents stay unavailable until the PIN is
/// verified again (see [`ScreenLockRule::attempt_correct_unlock`]).
#[derive(Debug)]
pub struct ScreenLockRule {
    device: DeviceContext,
    config: RuleConfig,
}

type Step<T> = Result<T, FixtureError>;

impl ScreenLockRule {
    pub fn new(device: DeviceContext, config: RuleConfig) -> Self {
        Self { device, config }
    }

    pub fn user(&self) -> UserId {
        self.device.user
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Run setup, `body`, then teardown.
    ///
    /// Teardown runs even if `body` panics; the panic is resumed afterward. If
    /// setup fails neither the body nor teardown run.
    pub fn run<R, F>(&self, body: F) -> Result<R, FixtureError>
    where
        F: FnOnce(&Self) -> R,
    {
        let snapshot = self.setup()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        let cleanup = self.teardown(snapshot);
        match outcome {
            Ok(value) => cleanup.map(|()| value),
            Err(payload) => {
                if let Err(e) = cleanup {
                    error!(user = %self.user(), error = %e, "teardown failed after test panic");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    pub fn setup(&self) -> Step<Snapshot> {
        info!(
            user = %self.user(),
            strong_auth = self.config.require_strong_auth,
            "screen lock setup"
        );
        self.verify_no_screen_lock_already_set()?;
        self.dismiss_keyguard()?;
        self.set_screen_lock()?;
        let instant_lock_on_power = self.set_lock_on_power_button()?;
        let strong_auth = self.configure_strong_auth_state()?;
        Ok(Snapshot {
            instant_lock_on_power,
            strong_auth,
        })
    }

    /// Undo setup. Every step runs even if an earlier one fails; all failures
    /// are reported together.
    pub fn teardown(&self, snapshot: Snapshot) -> Step<()> {
        info!(user = %self.user(), "screen lock teardown");
        let results = [
            self.restore_strong_auth_state(snapshot.strong_auth),
            self.remove_screen_lock(),
            self.revert_lock_on_power_button(snapshot.instant_lock_on_power),
            self.dismiss_keyguard(),
        ];
        let mut failures: Vec<FixtureError> =
            results.into_iter().filter_map(Result::err).collect();
        for e in &failures {
            error!(user = %self.user(), error = %e, "teardown step failed");
        }
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(FixtureError::Teardown(failures)),
        }
    }

    /// Get the device to an unlocked keyguard.
    ///
    /// Each poll wakes the screen if it is off, presses Back from attempt
    /// [`BOUNCER_ESCALATION_ATTEMPT`] onward to clear a bouncer, and asks the
    /// window manager to dismiss the keyguard.
    pub fn dismiss_keyguard(&self) -> Step<()> {
        let input = &self.device.input;
        let keyguard = &self.device.keyguard;
        self.wait("keyguard dismissed", |attempt| {
            if !input.is_screen_on()? {
                info!("waking device");
                input.wake_up()?;
            }
            // Bouncer may be shown due to a race; back dismisses it
            if attempt >= BOUNCER_ESCALATION_ATTEMPT {
                info!(attempt, "pressing back to dismiss bouncer");
                input.send_key(KeyCode::Back)?;
            }
            let ack = keyguard.dismiss_keyguard()?;
            debug!(attempt, ?ack, "dismiss keyguard requested");
            Ok(!keyguard.is_keyguard_locked()?)
        })
    }

    /// Enter the correct PIN and wait for strong auth to be lifted.
    pub fn attempt_correct_unlock(&self) -> Step<()> {
        let store = &self.device.credentials;
        let user = self.user();
        let outcome = store
            .verify_credential(&self.pin(), user, 0)
            .map_err(FixtureError::device("verify credential"))?;
        debug!(%user, ?outcome, "correct pin submitted");
        store
            .mark_user_present(user)
            .map_err(FixtureError::device("mark user present"))?;
        self.wait("strong auth not required", |_| {
            Ok(store.get_strong_auth(user)? == StrongAuthFlags::NOT_REQUIRED)
        })
    }

    /// Enter the wrong PIN once. Returns immediately with the store's verdict.
    pub fn attempt_incorrect_unlock(&self) -> Step<VerifyOutcome> {
        let user = self.user();
        let outcome = self
            .device
            .credentials
            .verify_credential(&Credential::pin(&self.config.wrong_pin), user, 0)
            .map_err(FixtureError::device("verify credential"))?;
        debug!(%user, ?outcome, "wrong pin submitted");
        Ok(outcome)
    }

    fn verify_no_screen_lock_already_set(&self) -> Step<()> {
        let secure = self
            .device
            .credentials
            .is_secure(self.user())
            .map_err(FixtureError::device("check existing screen lock"))?;
        if secure {
            return Err(FixtureError::Precondition(
                "Screen Lock must not already be set on device".into(),
            ));
        }
        Ok(())
    }

    fn set_screen_lock(&self) -> Step<()> {
        let store = &self.device.credentials;
        let user = self.user();
        let accepted = store
            .set_credential(&self.pin(), &Credential::None, user)
            .map_err(FixtureError::device("set lock credential"))?;
        if !accepted {
            return Err(FixtureError::Postcondition(
                "lock screen credential should be set".into(),
            ));
        }
        self.wait("screen lock set", |_| store.is_secure(user))?;
        info!(%user, "device pin set");
        Ok(())
    }

    fn set_lock_on_power_button(&self) -> Step<bool> {
        let store = &self.device.credentials;
        let user = self.user();
        let saved = store
            .get_power_button_instant_lock(user)
            .map_err(FixtureError::device("read power button instant lock"))?;
        store
            .set_power_button_instant_lock(true, user)
            .map_err(FixtureError::device("enable power button instant lock"))?;
        Ok(saved)
    }

    fn configure_strong_auth_state(&self) -> Step<StrongAuthFlags> {
        let store = &self.device.credentials;
        let user = self.user();
        let saved = store
            .get_strong_auth(user)
            .map_err(FixtureError::device("read strong auth"))?;
        if self.config.require_strong_auth {
            debug!(%user, "triggering strong auth due to simulated lockdown");
            store
                .require_strong_auth(StrongAuthFlags::REQUIRED_AFTER_USER_LOCKDOWN, user)
                .map_err(FixtureError::device("require strong auth"))?;
            self.wait("strong auth required after lockdown", |_| {
                Ok(store.get_strong_auth(user)? == StrongAuthFlags::REQUIRED_AFTER_USER_LOCKDOWN)
            })?;
        }
        Ok(saved)
    }

    fn restore_strong_auth_state(&self, saved: StrongAuthFlags) -> Step<()> {
        self.device
            .credentials
            .require_strong_auth(saved, self.user())
            .map_err(FixtureError::device("restore strong auth"))
    }

    fn remove_screen_lock(&self) -> Step<()> {
        let store = &self.device.credentials;
        let user = self.user();
        info!(%user, "removing screen lock");
        let unset = store
            .set_credential(&Credential::None, &self.pin(), user)
            .map_err(FixtureError::device("clear lock credential"))?;
        if !unset {
            return Err(FixtureError::Postcondition(
                "lock screen credential should be unset".into(),
            ));
        }
        store
            .set_lock_screen_disabled(true, user)
            .map_err(FixtureError::device("disable lock screen"))?;
        // Disabled and insecure are separate bits and can land at different times.
        self.wait("screen lock un-set", |_| store.is_lock_screen_disabled(user))?;
        self.wait("screen lock insecure", |_| Ok(!store.is_secure(user)?))
    }

    fn revert_lock_on_power_button(&self, saved: bool) -> Step<()> {
        self.device
            .credentials
            .set_power_button_instant_lock(saved, self.user())
            .map_err(FixtureError::device("revert power button instant lock"))
    }

    fn pin(&self) -> Credential {
        Credential::pin(&self.config.pin)
    }

    fn policy(&self) -> &WaitPolicy {
        &self.config.wait
    }

    fn wait<F>(&self, description: &'static str, condition: F) -> Step<()>
    where
        F: FnMut(u32) -> anyhow::Result<bool>,
    {
        match try_wait_until(description, self.policy(), condition) {
            Ok(used) => {
                debug!(description, attempts = used, "condition met");
                Ok(())
            }
            Err(WaitError::Timeout(t)) => Err(t.into()),
            Err(WaitError::Predicate { source, .. }) => {
                warn!(description, error = %source, "device call failed while polling");
                Err(FixtureError::Device {
                    step: description,
                    source,
                })
            }
        }
    }
}
