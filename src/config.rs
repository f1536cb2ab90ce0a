use anyhow::{Context, Result, anyhow, ensure};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::wait::WaitPolicy;

/// Environment variable naming a TOML file with [`RuleConfig`] overrides.
pub const CONFIG_PATH_ENV: &str = "SCREEN_LOCK_RULE_CONFIG";

pub const DEFAULT_PIN: &str = "0000";
pub const DEFAULT_WRONG_PIN: &str = "0001";

/// Where a [`RuleConfig`] came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
}

/// Settings for one [`crate::ScreenLockRule`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Put the user into post-lockdown strong auth during setup, so trust
    /// agents stay unavailable until the PIN is entered.
    pub require_strong_auth: bool,
    /// PIN installed for the test.
    pub pin: String,
    /// PIN used by failed unlock attempts. Must differ from `pin`.
    pub wrong_pin: String,
    pub wait: WaitPolicy,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            require_strong_auth: false,
            pin: DEFAULT_PIN.to_string(),
            wrong_pin: DEFAULT_WRONG_PIN.to_string(),
            wait: WaitPolicy::default(),
        }
    }
}

impl RuleConfig {
    pub fn strong_auth() -> Self {
        Self {
            require_strong_auth: true,
            ..Self::default()
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pin) in [("pin", &self.pin), ("wrong_pin", &self.wrong_pin)] {
            ensure!(!pin.is_empty(), "{name} must not be empty");
            ensure!(
                pin.bytes().all(|b| b.is_ascii_digit()),
                "{name} must contain only decimal digits"
            );
        }
        ensure!(self.pin != self.wrong_pin, "wrong_pin must differ from pin");
        Ok(())
    }

    /// Load from `$SCREEN_LOCK_RULE_CONFIG` if set, defaults otherwise.
    pub fn load_from_env() -> Result<(Self, ConfigSource)> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Same as [`Self::load_from_env`] with an injectable variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<(Self, ConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path_str) = lookup(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str.trim());
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }
        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read rule config from {}", path.display())
        })?;
        Self::parse_from_str(&contents, &path.display().to_string())
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| anyhow!("invalid rule config {origin}: {err}"))?;
        config
            .validate()
            .with_context(|| format!("invalid rule config {origin}"))?;
        Ok(config)
    }
}
