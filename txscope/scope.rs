// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::config::ScopeConfig;
use crate::context::{JobContext, RequestContext, CURRENT_SESSION};
use crate::error::ScopeError;
use crate::session::{Session, SessionProvider};
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Runs asynchronous computations inside a bound session and transaction.
///
/// The scope owns the process-wide session provider. The provider is installed when the process
/// starts and taken out again on shutdown; while no provider is installed, every entry point
/// fails with [`ScopeError::NoSessionProvider`].
pub struct TransactionScope<P> {
    provider: RwLock<Option<Arc<P>>>,
    config: ScopeConfig,
}

impl<P: SessionProvider> TransactionScope<P> {
    pub fn new(config: ScopeConfig) -> Self {
        Self {
            provider: RwLock::new(None),
            config,
        }
    }

    pub fn with_provider(config: ScopeConfig, provider: Arc<P>) -> Self {
        let scope = Self::new(config);
        scope.install(provider);
        scope
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Installs the session provider, returning the one it replaced.
    pub fn install(&self, provider: Arc<P>) -> Option<Arc<P>> {
        self.provider.write().replace(provider)
    }

    /// Removes the session provider. Scopes that are already running keep their sessions.
    pub fn shutdown(&self) -> Option<Arc<P>> {
        self.provider.write().take()
    }

    pub fn provider(&self) -> Result<Arc<P>, ScopeError> {
        self.provider
            .read()
            .clone()
            .ok_or(ScopeError::NoSessionProvider)
    }

    /// Returns a session for `unit`, or the session bound to `ctx` when no unit is given.
    ///
    /// A named unit always yields a fresh session straight from the provider, independent of
    /// any binding; the caller owns it and must close it.
    pub fn current_session(
        &self,
        ctx: &JobContext<P::Session>,
        unit: Option<&str>,
    ) -> Result<Arc<P::Session>, ScopeError> {
        match unit {
            Some(unit) => self.provider()?.open(unit),
            None => ctx.bound_session(),
        }
    }

    /// Like [`run_in_transaction`](Self::run_in_transaction), with the configured default unit
    /// and a read-write transaction.
    pub fn with_transaction<F, Fut, T>(
        &self,
        ctx: &JobContext<P::Session>,
        computation: F,
    ) -> Result<impl Future<Output = anyhow::Result<T>>, ScopeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_in_transaction(ctx, &self.config.default_unit, false, computation)
    }

    /// Runs `computation` with a session for `unit` bound to `ctx`.
    ///
    /// The session is opened and bound before this function returns; any problem doing so is
    /// reported synchronously and the computation is never invoked. The returned future then:
    ///
    /// 1. begins a transaction, unless `read_only`,
    /// 2. invokes `computation` exactly once and awaits its future,
    /// 3. on success, commits (or rolls back if the session was marked rollback-only); a failed
    ///    commit turns the success into a failure,
    /// 4. on failure, rolls back the transaction if it is still active, ignoring errors from the
    ///    rollback itself so they never mask the original failure,
    /// 5. closes the session and clears the binding, before its own output becomes observable.
    ///
    /// A panic in `computation`, or while polling its future, is handled like a failure: steps 4
    /// and 5 run and the panic resumes afterwards. Step 5 also runs if the future is dropped
    /// before it settles. Closing the session then discards any transaction that is still open.
    ///
    /// Nested scopes on the same request are rejected with [`ScopeError::AlreadyBound`].
    pub fn run_in_transaction<F, Fut, T>(
        &self,
        ctx: &JobContext<P::Session>,
        unit: &str,
        read_only: bool,
        computation: F,
    ) -> Result<impl Future<Output = anyhow::Result<T>>, ScopeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let bound = self.enter(ctx, unit)?;
        Ok(bound.run(read_only, computation))
    }

    fn enter(
        &self,
        ctx: &JobContext<P::Session>,
        unit: &str,
    ) -> Result<BoundSession<P::Session>, ScopeError> {
        let session = self.provider()?.open(unit)?;

        let carrier = match ctx.carrier() {
            Some(carrier) => carrier.clone(),
            None => {
                close_quietly(&*session);
                return Err(ScopeError::NoCarrier);
            }
        };
        if carrier.get(CURRENT_SESSION).is_some() {
            close_quietly(&*session);
            return Err(ScopeError::AlreadyBound);
        }

        carrier.put(CURRENT_SESSION, session.clone());
        debug!("Bound session for unit {:?}", unit);
        Ok(BoundSession {
            session,
            carrier,
            released: false,
        })
    }
}

fn close_quietly<S: Session>(session: &S) {
    if let Err(err) = session.close() {
        warn!("Could not close session for unit {:?}: {:?}", session.unit(), err);
    }
}

/// Transaction begun on a scoped session. Read-only scopes have none.
struct TransactionHandle<S> {
    session: Arc<S>,
}

impl<S: Session> TransactionHandle<S> {
    async fn begin(session: &Arc<S>) -> anyhow::Result<Self> {
        session.begin_transaction().await?;
        Ok(Self {
            session: session.clone(),
        })
    }

    async fn finish(&self) -> anyhow::Result<()> {
        if self.session.is_rollback_only() {
            debug!("Rolling back rollback-only transaction on unit {:?}", self.session.unit());
            self.session.rollback_transaction().await
        } else {
            debug!("Committing transaction on unit {:?}", self.session.unit());
            self.session.commit_transaction().await
        }
    }

    async fn abort(&self) {
        if !self.session.transaction_active().await {
            return;
        }
        debug!("Rolling back transaction on unit {:?}", self.session.unit());
        if let Err(err) = self.session.rollback_transaction().await {
            debug!("Ignoring failed rollback on unit {:?}: {:?}", self.session.unit(), err);
        }
    }
}

/// A session bound into a request context.
///
/// Releasing closes the session and clears the binding, exactly once. Dropping an unreleased
/// `BoundSession` releases it.
struct BoundSession<S: Session> {
    session: Arc<S>,
    carrier: Arc<RequestContext<S>>,
    released: bool,
}

impl<S: Session> BoundSession<S> {
    async fn run<F, Fut, T>(mut self, read_only: bool, computation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // an early return drops `self`, which releases the session
        let txn = match read_only {
            true => None,
            false => Some(TransactionHandle::begin(&self.session).await?),
        };

        // a panic in the computation takes the failure path before it resumes
        let outcome = match AssertUnwindSafe(async move { computation().await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                if let Some(txn) = &txn {
                    txn.abort().await;
                }
                self.release();
                std::panic::resume_unwind(payload);
            }
        };
        let outcome = match (outcome, &txn) {
            (Ok(value), Some(txn)) => txn.finish().await.map(|()| value),
            (outcome, _) => outcome,
        };
        if outcome.is_err() {
            if let Some(txn) = &txn {
                txn.abort().await;
            }
        }

        self.release();
        outcome
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        // the binding is cleared even if closing panics
        let _unbind = Unbind(&self.carrier);
        close_quietly(&*self.session);
        debug!("Released session for unit {:?}", self.session.unit());
    }
}

impl<S: Session> Drop for BoundSession<S> {
    fn drop(&mut self) {
        self.release();
    }
}

struct Unbind<'a, S>(&'a RequestContext<S>);

impl<S> Drop for Unbind<'_, S> {
    fn drop(&mut self) {
        self.0.remove(CURRENT_SESSION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestMeta;
    use crate::mock::{Event, Faults, MockProvider, MockSession};
    use anyhow::anyhow;
    use std::future::Ready;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn setup(faults: Faults) -> (Arc<MockProvider>, TransactionScope<MockProvider>) {
        let provider = Arc::new(MockProvider::with_faults(&["default", "reports"], faults));
        let scope = TransactionScope::with_provider(ScopeConfig::default(), provider.clone());
        (provider, scope)
    }

    fn request() -> JobContext<MockSession> {
        JobContext::http_request(RequestMeta::default())
    }

    fn is_unbound(ctx: &JobContext<MockSession>) -> bool {
        ctx.carrier().unwrap().get(CURRENT_SESSION).is_none()
    }

    #[tokio::test]
    async fn commits_before_releasing_on_success() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let job = ctx.clone();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let session = job.bound_session()?;
                assert_eq!(session.unit(), "default");
                Ok::<_, anyhow::Error>(42)
            })
            .unwrap();

        // bound as soon as the scope is entered, before the computation runs
        assert!(ctx.bound_session().is_ok());
        assert!(provider.events().is_empty());

        assert_eq!(fut.await.unwrap(), 42);
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Commit, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn rolls_back_on_failure() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<i32, _>(anyhow!("boom"))
            })
            .unwrap();

        let err = fut.await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Rollback, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn failed_rollback_does_not_mask_failure() {
        let (provider, scope) = setup(Faults {
            rollback: true,
            ..Default::default()
        });
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                Err::<(), _>(anyhow!("boom"))
            })
            .unwrap();

        assert_eq!(fut.await.unwrap_err().to_string(), "boom");
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Rollback, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn read_only_never_touches_the_transaction() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", true, || async {
                Ok::<_, anyhow::Error>("ok")
            })
            .unwrap();
        assert_eq!(fut.await.unwrap(), "ok");
        assert_eq!(provider.events(), vec![Event::Close]);
        assert!(is_unbound(&ctx));

        let fut = scope
            .run_in_transaction(&ctx, "default", true, || async {
                Err::<(), _>(anyhow!("boom"))
            })
            .unwrap();
        assert!(fut.await.is_err());
        assert_eq!(provider.events(), vec![Event::Close, Event::Close]);
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn failed_commit_fails_the_future() {
        let (provider, scope) = setup(Faults {
            commit: true,
            ..Default::default()
        });
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                Ok::<_, anyhow::Error>(42)
            })
            .unwrap();

        assert_eq!(fut.await.unwrap_err().to_string(), "commit failed");
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Commit, Event::Rollback, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn rollback_only_skips_commit() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let job = ctx.clone();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, move || async move {
                job.bound_session()?.set_rollback_only();
                Ok::<_, anyhow::Error>("discarded")
            })
            .unwrap();

        assert_eq!(fut.await.unwrap(), "discarded");
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Rollback, Event::Close]
        );
    }

    #[tokio::test]
    async fn failed_begin_skips_computation() {
        let (provider, scope) = setup(Faults {
            begin: true,
            ..Default::default()
        });
        let ctx = request();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .unwrap();

        assert_eq!(fut.await.unwrap_err().to_string(), "begin failed");
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(provider.events(), vec![Event::Begin, Event::Close]);
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn failed_close_still_unbinds() {
        let (provider, scope) = setup(Faults {
            close: true,
            ..Default::default()
        });
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                Ok::<_, anyhow::Error>(1)
            })
            .unwrap();

        assert_eq!(fut.await.unwrap(), 1);
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Commit, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn unknown_unit_acquires_nothing() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let res = scope.run_in_transaction(&ctx, "missing", false, || async {
            Ok::<_, anyhow::Error>(())
        });

        match res.err() {
            Some(ScopeError::NoPersistenceUnit(unit)) => assert_eq!(unit, "missing"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(provider.opened(), 0);
        assert!(provider.events().is_empty());
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn missing_provider_is_reported() {
        let scope = TransactionScope::<MockProvider>::new(ScopeConfig::default());
        let res = scope.run_in_transaction(&request(), "default", false, || async {
            Ok::<_, anyhow::Error>(())
        });
        assert!(matches!(res.err(), Some(ScopeError::NoSessionProvider)));

        let (_, scope) = setup(Faults::default());
        assert!(scope.shutdown().is_some());
        let res = scope.with_transaction(&request(), || async { Ok::<_, anyhow::Error>(()) });
        assert!(matches!(res.err(), Some(ScopeError::NoSessionProvider)));
        assert!(matches!(
            scope.current_session(&request(), Some("default")),
            Err(ScopeError::NoSessionProvider)
        ));
    }

    #[tokio::test]
    async fn background_job_has_no_carrier() {
        let (provider, scope) = setup(Faults::default());
        let res = scope.run_in_transaction(&JobContext::Background, "default", false, || async {
            Ok::<_, anyhow::Error>(())
        });

        assert!(matches!(res.err(), Some(ScopeError::NoCarrier)));
        // the session was opened, so it has to be closed again
        assert_eq!(provider.opened(), 1);
        assert_eq!(provider.events(), vec![Event::Close]);
    }

    #[tokio::test]
    async fn nested_scope_is_rejected() {
        let (provider, scope) = setup(Faults::default());
        let scope = Arc::new(scope);
        let ctx = request();

        let inner_scope = scope.clone();
        let job = ctx.clone();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, move || async move {
                let outer = job.bound_session()?;
                let nested = inner_scope.run_in_transaction(&job, "reports", false, || async {
                    Ok::<_, anyhow::Error>(())
                });
                assert!(matches!(nested.err(), Some(ScopeError::AlreadyBound)));
                // the outer binding survives the rejected attempt
                assert!(Arc::ptr_eq(&outer, &job.bound_session()?));
                Ok::<_, anyhow::Error>(())
            })
            .unwrap();

        fut.await.unwrap();
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Close, Event::Commit, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn dropping_the_future_releases_the_session() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();

        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                Ok::<_, anyhow::Error>(())
            })
            .unwrap();
        drop(fut);
        assert_eq!(provider.events(), vec![Event::Close]);
        assert!(is_unbound(&ctx));

        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                futures::future::pending::<()>().await;
                Ok::<_, anyhow::Error>(())
            })
            .unwrap();
        let res = tokio::time::timeout(Duration::from_millis(20), fut).await;
        assert!(res.is_err());
        assert_eq!(
            provider.events(),
            vec![Event::Close, Event::Begin, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn default_unit_comes_from_config() {
        let provider = Arc::new(MockProvider::new(&["reports"]));
        let config = ScopeConfig {
            default_unit: "reports".into(),
        };
        let scope = TransactionScope::with_provider(config, provider.clone());
        let ctx = request();
        let job = ctx.clone();
        let fut = scope
            .with_transaction(&ctx, move || async move {
                Ok::<_, anyhow::Error>(job.bound_session()?.unit().to_owned())
            })
            .unwrap();

        assert_eq!(fut.await.unwrap(), "reports");
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Commit, Event::Close]
        );
    }

    #[tokio::test]
    async fn current_session_lookup() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();

        assert!(matches!(
            scope.current_session(&ctx, None),
            Err(ScopeError::UnboundSession)
        ));
        assert!(matches!(
            scope.current_session(&JobContext::Background, None),
            Err(ScopeError::UnboundSession)
        ));

        // a named unit bypasses the binding
        let session = scope
            .current_session(&JobContext::Background, Some("reports"))
            .unwrap();
        assert_eq!(session.unit(), "reports");
        assert_eq!(provider.opened(), 1);
        assert!(is_unbound(&ctx));
        assert!(matches!(
            scope.current_session(&ctx, Some("missing")),
            Err(ScopeError::NoPersistenceUnit(_))
        ));
    }

    #[tokio::test]
    async fn panicking_computation_rolls_back() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, || -> Ready<anyhow::Result<()>> {
                panic!("sync boom")
            })
            .unwrap();

        let res = AssertUnwindSafe(fut).catch_unwind().await;
        assert!(res.is_err());
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Rollback, Event::Close]
        );
        assert!(is_unbound(&ctx));

        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                let fail = true;
                tokio::task::yield_now().await;
                if fail {
                    panic!("async boom");
                }
                Ok::<_, anyhow::Error>(())
            })
            .unwrap();
        let payload = AssertUnwindSafe(fut).catch_unwind().await.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"async boom"));
        assert_eq!(
            provider.events(),
            vec![
                Event::Begin,
                Event::Rollback,
                Event::Close,
                Event::Begin,
                Event::Rollback,
                Event::Close
            ]
        );
        assert!(is_unbound(&ctx));
    }

    #[tokio::test]
    async fn panicking_read_only_computation_releases() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", true, || -> Ready<anyhow::Result<()>> {
                panic!("sync boom")
            })
            .unwrap();

        assert!(AssertUnwindSafe(fut).catch_unwind().await.is_err());
        assert_eq!(provider.events(), vec![Event::Close]);
        assert!(is_unbound(&ctx));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settles_on_another_worker() {
        let (provider, scope) = setup(Faults::default());
        let ctx = request();
        let fut = scope
            .run_in_transaction(&ctx, "default", false, || async {
                tokio::task::yield_now().await;
                Ok::<_, anyhow::Error>("ok")
            })
            .unwrap();

        let value = tokio::spawn(fut).await.unwrap().unwrap();
        assert_eq!(value, "ok");
        assert_eq!(
            provider.events(),
            vec![Event::Begin, Event::Commit, Event::Close]
        );
        assert!(is_unbound(&ctx));
    }
}
