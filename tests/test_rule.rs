use screen_lock_rule::{
    BOUNCER_ESCALATION_ATTEMPT, Credential, DeviceContext, FixtureError, KeyCode, RuleConfig,
    ScreenLockRule, SimulatedDevice, StrongAuthFlags, UserId, VerifyOutcome, WaitPolicy,
    init_tracing,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

const USER: UserId = UserId(0);

fn rule_for(device: &Arc<SimulatedDevice>, config: RuleConfig) -> ScreenLockRule {
    init_tracing();
    let config = config.with_wait(WaitPolicy::immediate(20));
    ScreenLockRule::new(DeviceContext::from_backend(device, USER), config)
}

fn laggy_device() -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::builder().settle_after(2).build())
}

#[test]
fn setup_installs_pin_and_teardown_removes_it() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::default());

    let snapshot = rule.setup().unwrap();
    assert!(device.secure());
    assert_eq!(device.credential(), Credential::pin("0000"));
    assert!(device.instant_lock());
    assert!(!snapshot.instant_lock_on_power());

    rule.teardown(snapshot).unwrap();
    assert!(!device.secure());
    assert_eq!(device.credential(), Credential::None);
    assert!(device.lock_screen_disabled());
    assert!(!device.instant_lock());
    assert!(!device.keyguard_locked());
}

#[test]
fn strong_auth_lockdown_lifted_by_correct_unlock() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::strong_auth());

    let snapshot = rule.setup().unwrap();
    assert_eq!(snapshot.strong_auth(), StrongAuthFlags::NOT_REQUIRED);
    assert_eq!(device.strong_auth(), StrongAuthFlags::REQUIRED_AFTER_USER_LOCKDOWN);

    rule.attempt_correct_unlock().unwrap();
    assert_eq!(device.strong_auth(), StrongAuthFlags::NOT_REQUIRED);

    rule.teardown(snapshot).unwrap();
    assert_eq!(device.strong_auth(), StrongAuthFlags::NOT_REQUIRED);
}

#[test]
fn teardown_restores_non_default_strong_auth() {
    let device = Arc::new(
        SimulatedDevice::builder()
            .strong_auth(StrongAuthFlags::REQUIRED_AFTER_BOOT)
            .instant_lock(true)
            .build(),
    );
    let rule = rule_for(&device, RuleConfig::strong_auth());

    rule.run(|_| {
        assert_eq!(device.strong_auth(), StrongAuthFlags::REQUIRED_AFTER_USER_LOCKDOWN);
    })
    .unwrap();

    assert_eq!(device.strong_auth(), StrongAuthFlags::REQUIRED_AFTER_BOOT);
    assert!(device.instant_lock());
}

#[test]
fn incorrect_unlock_keeps_lockdown() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::strong_auth());

    let outcome = rule
        .run(|r| {
            let outcome = r.attempt_incorrect_unlock().unwrap();
            assert_eq!(device.strong_auth(), StrongAuthFlags::REQUIRED_AFTER_USER_LOCKDOWN);
            outcome
        })
        .unwrap();

    assert_eq!(outcome, VerifyOutcome::Mismatch);
    assert_eq!(device.failed_attempts(), 1);
}

#[test]
fn existing_lock_fails_before_any_mutation() {
    let device = Arc::new(
        SimulatedDevice::builder()
            .credential(Credential::pin("4321"))
            .strong_auth(StrongAuthFlags::REQUIRED_AFTER_TIMEOUT)
            .build(),
    );
    let rule = rule_for(&device, RuleConfig::strong_auth());

    let err = rule.setup().unwrap_err();
    assert!(matches!(err, FixtureError::Precondition(_)), "{err}");
    assert!(device.secure());
    assert_eq!(device.credential(), Credential::pin("4321"));
    assert_eq!(device.strong_auth(), StrongAuthFlags::REQUIRED_AFTER_TIMEOUT);
    assert!(!device.instant_lock());
    assert_eq!(device.dismiss_requests(), 0);
}

#[test]
fn run_skips_body_when_setup_fails() {
    let device = Arc::new(
        SimulatedDevice::builder()
            .credential(Credential::pin("4321"))
            .build(),
    );
    let rule = rule_for(&device, RuleConfig::default());

    let mut ran = false;
    let result = rule.run(|_| ran = true);
    assert!(result.is_err());
    assert!(!ran);
}

#[test]
fn body_error_is_returned_after_teardown() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::default());

    let result = rule
        .run(|_| -> Result<(), &'static str> { Err("assertion in body") })
        .unwrap();
    assert_eq!(result, Err("assertion in body"));
    assert!(!device.secure());
}

#[test]
fn teardown_runs_when_body_panics() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::strong_auth());

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        let _: Result<(), _> = rule.run(|_| panic!("test body failed"));
    }));

    assert!(caught.is_err());
    assert!(!device.secure());
    assert_eq!(device.strong_auth(), StrongAuthFlags::NOT_REQUIRED);
    assert!(!device.instant_lock());
}

#[test]
fn bouncer_is_dismissed_with_back_after_escalation() {
    let device = Arc::new(
        SimulatedDevice::builder()
            .keyguard_locked(true)
            .bouncer_shown(true)
            .build(),
    );
    let rule = rule_for(&device, RuleConfig::default());

    rule.dismiss_keyguard().unwrap();
    assert_eq!(device.key_presses(), vec![KeyCode::Back]);
    assert_eq!(device.dismiss_requests(), BOUNCER_ESCALATION_ATTEMPT + 1);
    assert!(!device.keyguard_locked());
}

#[test]
fn no_back_press_when_keyguard_dismisses_early() {
    let device = Arc::new(
        SimulatedDevice::builder()
            .keyguard_locked(true)
            .screen_on(false)
            .settle_after(3)
            .build(),
    );
    let rule = rule_for(&device, RuleConfig::default());

    rule.dismiss_keyguard().unwrap();
    assert!(device.key_presses().is_empty());
    assert_eq!(device.wake_ups(), 1);
    assert!(device.screen_on());
}

#[test]
fn body_can_relock_and_dismiss() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::default());

    rule.run(|r| {
        device.lock_now();
        assert!(device.keyguard_locked());
        r.dismiss_keyguard().unwrap();
        assert!(!device.keyguard_locked());
    })
    .unwrap();
}

#[test]
fn failed_credential_clear_does_not_stop_later_steps() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::strong_auth());

    let err = rule
        .run(|_| device.set_fail_credential_clear(true))
        .unwrap_err();

    assert!(matches!(err, FixtureError::Postcondition(_)), "{err}");
    assert!(err.to_string().contains("lock screen credential should be unset"));
    // Credential is stranded, but everything after it was still restored.
    assert!(device.secure());
    assert!(!device.instant_lock());
    assert_eq!(device.strong_auth(), StrongAuthFlags::NOT_REQUIRED);
}

#[test]
fn stuck_secure_times_out_on_insecure_wait() {
    let device = laggy_device();
    let rule = rule_for(&device, RuleConfig::default());

    let err = rule.run(|_| device.set_stuck_secure(true)).unwrap_err();
    assert!(err.is_timeout_for("screen lock insecure"), "{err}");
    assert!(!device.instant_lock());
}

#[test]
fn multiple_teardown_failures_are_collected() {
    let device = Arc::new(SimulatedDevice::default());
    init_tracing();
    let rule = ScreenLockRule::new(
        DeviceContext::from_backend(&device, USER),
        RuleConfig::default().with_wait(WaitPolicy::immediate(5)),
    );

    let err = rule
        .run(|_| {
            device.set_fail_credential_clear(true);
            device.lock_now();
            device.show_bouncer();
        })
        .unwrap_err();

    let FixtureError::Teardown(failures) = &err else {
        panic!("expected collected teardown failures, got {err}");
    };
    assert_eq!(failures.len(), 2);
    assert!(matches!(failures[0], FixtureError::Postcondition(_)));
    assert!(err.is_timeout_for("keyguard dismissed"));
    assert!(!device.instant_lock());
}

#[test]
fn slow_device_times_out_during_setup_without_rollback() {
    let device = Arc::new(SimulatedDevice::builder().settle_after(10).build());
    init_tracing();
    let rule = ScreenLockRule::new(
        DeviceContext::from_backend(&device, USER),
        RuleConfig::default().with_wait(WaitPolicy::immediate(3)),
    );

    let err = rule.setup().unwrap_err();
    assert!(err.is_timeout_for("screen lock set"), "{err}");
    assert!(err.to_string().contains("3 attempts"));
    assert_eq!(device.credential(), Credential::pin("0000"));
}

#[test]
fn disconnected_device_reports_failing_step() {
    let device = laggy_device();
    device.set_disconnected(true);
    let rule = rule_for(&device, RuleConfig::default());

    let err = rule.setup().unwrap_err();
    assert!(matches!(err, FixtureError::Device { .. }), "{err}");
    assert!(err.to_string().contains("device disconnected"));
}

#[test]
fn custom_pins_and_user_are_used() {
    let user = UserId(10);
    let device = Arc::new(SimulatedDevice::builder().user(user).build());
    let config = RuleConfig {
        pin: "135790".into(),
        wrong_pin: "000000".into(),
        ..RuleConfig::strong_auth()
    }
    .with_wait(WaitPolicy::immediate(20));
    let rule = ScreenLockRule::new(DeviceContext::from_backend(&device, user), config);
    assert_eq!(rule.user(), user);
    assert_eq!(rule.config().pin, "135790");
    assert!(rule.config().require_strong_auth);

    rule.run(|r| {
        assert_eq!(device.credential(), Credential::pin("135790"));
        assert_eq!(r.attempt_incorrect_unlock().unwrap(), VerifyOutcome::Mismatch);
        r.attempt_correct_unlock().unwrap();
    })
    .unwrap();
    assert!(!device.secure());
}
