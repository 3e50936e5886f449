// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! # Transaction scopes for asynchronous handlers
//!
//! ## Requirements
//!
//! - Handlers return futures that may settle long after the handler function itself returned,
//!   possibly on a different worker thread.
//! - The database session used by a handler must stay open until that future settles, and must
//!   be closed and unbound exactly once, whichever way it settles.
//!
//! ## Design
//!
//! A [`TransactionScope`] owns the process-wide [`SessionProvider`]. For every request, the
//! caller passes a [`JobContext`] around explicitly; when the job is an HTTP request it carries a
//! [`RequestContext`] whose binding slot holds the session of the running scope, so nested code
//! can find it without threading it through every call:
//!
//! ```ignore
//! let fut = scope.run_in_transaction(&ctx, "default", false, move || async move {
//!     let session = ctx.bound_session()?;
//!     session.execute(&SqlWithArguments::new("DELETE FROM hits")).await?;
//!     Ok(())
//! })?;
//! fut.await?;
//! ```
//!
//! `run_in_transaction` fails synchronously with a [`ScopeError`] when the scope cannot be set
//! up. Otherwise it returns a future that begins the transaction (unless read-only), runs the
//! computation, commits or rolls back, and finally closes the session and clears the binding.
//! The cleanup lives in a drop guard, so it also runs when the future is dropped early.

#[macro_use]
extern crate log;

pub mod action;
pub mod config;
pub mod context;
pub mod error;
#[cfg(test)]
mod mock;
pub mod scope;
pub mod session;
pub mod sql;

pub use crate::action::{Transactional, TransactionalAction};
pub use crate::config::{PersistenceConfig, ScopeConfig, UnitConfig, DEFAULT_UNIT};
pub use crate::context::{JobContext, RequestContext, RequestMeta, CURRENT_SESSION};
pub use crate::error::ScopeError;
pub use crate::scope::TransactionScope;
pub use crate::session::{Session, SessionProvider};
pub use crate::sql::{SqlProvider, SqlSession, SqlValue, SqlWithArguments};
