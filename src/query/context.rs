//! Query execution context
//!
//! A `Context` is handed to `Query::exec` and threaded through admission
//! and evaluation. It combines:
//!
//! - any number of cancellation tokens (caller, engine shutdown, query)
//! - an optional deadline
//! - optional origin metadata that ends up in the query log
//!
//! Contexts are immutable; the `with_*` methods derive a child that adds
//! to what the parent already carries. Timeouts and cancellation are
//! observed the same way and differ only in the error reported.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_all;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::query::error::{QueryError, QueryResult};

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    Canceled,
    DeadlineExceeded,
}

impl ContextError {
    /// Convert to a query error naming where it was noticed
    pub fn into_query_error(self, env: &str) -> QueryError {
        match self {
            ContextError::Canceled => QueryError::Canceled(env.to_string()),
            ContextError::DeadlineExceeded => QueryError::Timeout(env.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    tokens: Vec<CancellationToken>,
    deadline: Option<Instant>,
    origin: Option<Arc<Map<String, Value>>>,
}

impl Context {
    /// A context that is never done
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child plus the token that cancels it
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = CancellationToken::new();
        (self.with_token(token.clone()), token)
    }

    /// Derive a child that is also done when `token` is cancelled
    pub fn with_token(&self, token: CancellationToken) -> Self {
        let mut child = self.clone();
        child.tokens.push(token);
        child
    }

    /// Derive a child with a deadline `timeout` from now. An earlier
    /// inherited deadline wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        child
    }

    /// Attach metadata describing who issued the query
    pub fn with_origin(&self, origin: Map<String, Value>) -> Self {
        let mut child = self.clone();
        child.origin = Some(Arc::new(origin));
        child
    }

    pub fn origin(&self) -> Option<&Map<String, Value>> {
        self.origin.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Some` once the context is cancelled or past its deadline
    pub fn err(&self) -> Option<ContextError> {
        if self.tokens.iter().any(CancellationToken::is_cancelled) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Cooperative checkpoint
    pub fn check(&self, env: &str) -> QueryResult<()> {
        match self.err() {
            Some(err) => Err(err.into_query_error(env)),
            None => Ok(()),
        }
    }

    /// Resolve when the context becomes done
    pub async fn done(&self) -> ContextError {
        let cancelled = async {
            if self.tokens.is_empty() {
                std::future::pending::<()>().await;
            } else {
                select_all(self.tokens.iter().map(|t| Box::pin(t.cancelled()))).await;
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => ContextError::Canceled,
            _ = expired => ContextError::DeadlineExceeded,
        }
    }
}
