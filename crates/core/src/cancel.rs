//! Cancellation / deadline signal accepted by every async operation.

use std::future::{Future, pending};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RepositoryError, RepositoryResult};

/// Cancellation token plus optional deadline.
///
/// `Cancellation::none()` never fires. Cloning shares the token.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now. Requires a tokio runtime with time enabled.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        let token_fired = self.token.as_ref().is_some_and(|t| t.is_cancelled());
        let deadline_passed = self.deadline.is_some_and(|d| Instant::now() >= d);
        token_fired || deadline_passed
    }

    pub fn check(&self) -> RepositoryResult<()> {
        if self.is_cancelled() {
            Err(RepositoryError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` unless the signal fires first.
    ///
    /// A future that has already completed wins over a signal that fires in the
    /// same poll. When the signal wins `fut` is dropped mid-flight, so only wrap
    /// work that is safe to abandon (reads, statements inside an uncommitted
    /// transaction).
    pub async fn run<F, T>(&self, fut: F) -> RepositoryResult<T>
    where
        F: Future<Output = RepositoryResult<T>>,
    {
        self.check()?;

        let token_fired = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let deadline_passed = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = fut => result,
            _ = token_fired => Err(RepositoryError::Cancelled),
            _ = deadline_passed => Err(RepositoryError::Cancelled),
        }
    }
}

impl From<CancellationToken> for Cancellation {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}
