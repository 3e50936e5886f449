// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::error::ScopeError;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Unit of work handed out by a [`SessionProvider`].
///
/// A session is shared between the scope that owns it and the handler code that finds it in
/// the request context, so every method takes `&self`. At most one transaction is open on a
/// session at a time.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Name of the persistence unit this session was opened for.
    fn unit(&self) -> &str;

    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn rollback_transaction(&self) -> Result<()>;

    /// Whether a transaction was begun and is not yet committed or rolled back.
    async fn transaction_active(&self) -> bool;

    /// Marks the current transaction so that it is rolled back instead of committed.
    fn set_rollback_only(&self);

    fn is_rollback_only(&self) -> bool;

    /// Releases the session. An active transaction is discarded.
    ///
    /// This is synchronous because it must be callable from `Drop`.
    fn close(&self) -> Result<()>;
}

/// Resolves persistence unit names to sessions.
pub trait SessionProvider: Send + Sync + 'static {
    type Session: Session;

    /// Opens a new session for `unit`, failing with [`ScopeError::NoPersistenceUnit`] when the
    /// unit is not configured. Opening must not block on I/O; connections are checked out
    /// lazily by the session.
    fn open(&self, unit: &str) -> Result<Arc<Self::Session>, ScopeError>;
}
