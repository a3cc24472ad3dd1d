//! Transaction context and completion hooks.

use crate::error::Fault;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

const COMPONENT: &str = "transaction";

type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A completion callback registered with a transaction at call time.
///
/// The commit arm runs after the transaction durably commits; the rollback
/// arm runs when it rolls back. Either arm may be absent.
pub struct CommitHook {
    label: String,
    on_commit: Option<HookFn>,
    on_rollback: Option<HookFn>,
}

impl CommitHook {
    pub fn new(label: impl Into<String>) -> Self {
        CommitHook {
            label: label.into(),
            on_commit: None,
            on_rollback: None,
        }
    }

    pub fn on_commit<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_commit = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn on_rollback<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_rollback = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs the arm matching the transaction outcome. Store implementations
    /// call this once per hook after completion is decided.
    pub async fn complete(self, committed: bool) {
        let arm = if committed {
            self.on_commit
        } else {
            self.on_rollback
        };
        if let Some(hook) = arm {
            hook().await;
        }
    }
}

impl Debug for CommitHook {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHook")
            .field("label", &self.label)
            .field("on_commit", &self.on_commit.is_some())
            .field("on_rollback", &self.on_rollback.is_some())
            .finish()
    }
}

/// One store transaction. Commit and rollback are synchronous from the
/// caller's perspective: the future resolves only once the outcome is durable
/// and every registered hook has run.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn register_hook(&self, hook: CommitHook);

    async fn commit(&self) -> Result<(), Fault>;

    async fn rollback(&self) -> Result<(), Fault>;
}

/// Distinguishes a caller-supplied transaction from one this layer opened
/// itself. Operations that accept an optional transaction resolve a scope up
/// front and conclude it at the end: owned transactions are committed (or
/// rolled back on failure), caller transactions are left untouched.
pub(crate) enum TxnScope {
    Caller(Arc<dyn Transaction>),
    Owned(Arc<dyn Transaction>),
}

impl TxnScope {
    pub(crate) fn caller(txn: Arc<dyn Transaction>) -> Self {
        TxnScope::Caller(txn)
    }

    pub(crate) fn owned(txn: Arc<dyn Transaction>) -> Self {
        TxnScope::Owned(txn)
    }

    pub(crate) fn transaction(&self) -> &Arc<dyn Transaction> {
        match self {
            TxnScope::Caller(txn) | TxnScope::Owned(txn) => txn,
        }
    }

    /// Commits an owned transaction; a caller transaction is the caller's to
    /// complete.
    pub(crate) async fn conclude(self) -> Result<(), Fault> {
        match self {
            TxnScope::Caller(_) => Ok(()),
            TxnScope::Owned(txn) => txn.commit().await,
        }
    }

    /// Rolls back an owned transaction after a failure. A rollback failure is
    /// logged and swallowed: the original fault is what the caller must see.
    pub(crate) async fn abandon(self) {
        if let TxnScope::Owned(txn) = self {
            if let Err(fault) = txn.rollback().await {
                warn!(
                    component = COMPONENT,
                    err = %fault,
                    "rollback of owned transaction failed"
                );
            }
        }
    }
}
