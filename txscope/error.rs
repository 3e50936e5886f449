// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

/// Errors raised while setting up a transaction scope, before the computation runs.
///
/// Failures that happen after the computation was invoked (the computation's own errors,
/// commit failures, database errors) travel as `anyhow::Error` through the returned future.
#[derive(thiserror::Error, Debug)]
pub enum ScopeError {
    #[error("no session provider is installed")]
    NoSessionProvider,
    #[error("no persistence unit configured for name [{0}]")]
    NoPersistenceUnit(String),
    #[error("no request context to bind the session to")]
    NoCarrier,
    #[error(
        "no session bound to the current request context; \
        wrap this call in `TransactionScope::run_in_transaction`"
    )]
    UnboundSession,
    #[error("a session is already bound to the current request context")]
    AlreadyBound,
}
