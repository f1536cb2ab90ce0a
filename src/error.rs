use thiserror::Error;

use crate::wait::ConditionTimeout;

/// Failures surfaced by [`crate::ScreenLockRule`].
///
/// Every variant is fatal to the test that owns the rule; nothing is retried
/// beyond the attempt budget of the poll that produced it.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// Device was not in the state required before setup touched anything.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    ConditionTimeout(#[from] ConditionTimeout),

    /// Device reported that a mutation did not take effect.
    #[error("postcondition failed: {0}")]
    Postcondition(String),

    /// A capability call itself failed.
    #[error("{step}: {source:#}")]
    Device {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("teardown failed: {}", join_failures(.0))]
    Teardown(Vec<FixtureError>),
}

impl FixtureError {
    pub(crate) fn device(step: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Device { step, source }
    }

    /// Failures contained in this error, flattening [`FixtureError::Teardown`].
    pub fn failures(&self) -> Vec<&FixtureError> {
        match self {
            Self::Teardown(all) => all.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }

    /// Whether this error (or any collected teardown failure) is a poll timeout
    /// for the given description.
    pub fn is_timeout_for(&self, description: &str) -> bool {
        self.failures().iter().any(|e| {
            matches!(e, Self::ConditionTimeout(t) if t.description == description)
        })
    }
}

fn join_failures(all: &[FixtureError]) -> String {
    all.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
