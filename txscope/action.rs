// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::config::DEFAULT_UNIT;
use crate::context::JobContext;
use crate::error::ScopeError;
use crate::scope::TransactionScope;
use crate::session::SessionProvider;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Declares how an endpoint wants its transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Transactional {
    /// Persistence unit to open the session on.
    pub unit: String,
    pub read_only: bool,
}

impl Default for Transactional {
    fn default() -> Self {
        Self {
            unit: DEFAULT_UNIT.into(),
            read_only: false,
        }
    }
}

impl Transactional {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.into(),
            ..Default::default()
        }
    }

    pub fn with_read_only(self, read_only: bool) -> Self {
        Self { read_only, ..self }
    }
}

/// Endpoint handler wrapped in the transaction its [`Transactional`] record asks for.
pub struct TransactionalAction<P, H> {
    scope: Arc<TransactionScope<P>>,
    config: Transactional,
    handler: Arc<H>,
}

impl<P, H> Clone for TransactionalAction<P, H> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<P, H, Fut, T> TransactionalAction<P, H>
where
    P: SessionProvider,
    H: Fn(JobContext<P::Session>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    pub fn new(scope: Arc<TransactionScope<P>>, config: Transactional, handler: H) -> Self {
        Self {
            scope,
            config,
            handler: Arc::new(handler),
        }
    }

    /// Invokes the handler for `ctx` inside a transaction scope. The returned future is the
    /// response future of the endpoint.
    pub fn call(
        &self,
        ctx: &JobContext<P::Session>,
    ) -> Result<impl Future<Output = anyhow::Result<T>>, ScopeError> {
        let handler = self.handler.clone();
        let job = ctx.clone();
        self.scope.run_in_transaction(
            ctx,
            &self.config.unit,
            self.config.read_only,
            move || (*handler)(job),
        )
    }
}
