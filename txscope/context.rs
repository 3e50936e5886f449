// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::error::ScopeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Key of the binding slot that holds the session of the running transaction scope.
pub const CURRENT_SESSION: &str = "currentSession";

/// Metadata of the HTTP request that a [`RequestContext`] belongs to.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: String,
    /// URL path of the request, without the query string.
    pub path: String,
    pub query: Option<String>,
}

/// Per-request store bearing the sessions bound to the request.
///
/// One `RequestContext` exists per in-flight request and it is never shared between requests.
/// The mutex only makes the context `Sync` so that the request future can hop between worker
/// threads; it never contends.
pub struct RequestContext<S> {
    meta: RequestMeta,
    slots: Mutex<HashMap<String, Arc<S>>>,
}

impl<S> RequestContext<S> {
    pub fn new(meta: RequestMeta) -> Self {
        Self {
            meta,
            slots: Default::default(),
        }
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    pub fn get(&self, key: &str) -> Option<Arc<S>> {
        self.slots.lock().get(key).cloned()
    }

    /// Stores `value` under `key`, returning the value it replaced.
    pub fn put(&self, key: &str, value: Arc<S>) -> Option<Arc<S>> {
        self.slots.lock().insert(key.to_owned(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<S>> {
        self.slots.lock().remove(key)
    }
}

/// Context of the job that is currently being handled.
///
/// The context is passed explicitly to every piece of code that may need the bound session.
/// Only HTTP requests carry a [`RequestContext`]; background jobs have nothing a session could
/// be bound to.
pub enum JobContext<S> {
    HttpRequest(Arc<RequestContext<S>>),
    Background,
}

impl<S> Clone for JobContext<S> {
    fn clone(&self) -> Self {
        match self {
            JobContext::HttpRequest(ctx) => JobContext::HttpRequest(ctx.clone()),
            JobContext::Background => JobContext::Background,
        }
    }
}

impl<S> JobContext<S> {
    pub fn http_request(meta: RequestMeta) -> Self {
        JobContext::HttpRequest(Arc::new(RequestContext::new(meta)))
    }

    pub fn carrier(&self) -> Option<&Arc<RequestContext<S>>> {
        match self {
            JobContext::HttpRequest(ctx) => Some(ctx),
            JobContext::Background => None,
        }
    }

    /// Returns the session bound to this job.
    pub fn bound_session(&self) -> Result<Arc<S>, ScopeError> {
        self.carrier()
            .and_then(|ctx| ctx.get(CURRENT_SESSION))
            .ok_or(ScopeError::UnboundSession)
    }

    /// Binds `session` to this job, or clears the binding when `session` is `None`.
    pub fn bind(&self, session: Option<Arc<S>>) -> Result<(), ScopeError> {
        let ctx = self.carrier().ok_or(ScopeError::NoCarrier)?;
        match session {
            Some(session) => {
                ctx.put(CURRENT_SESSION, session);
            }
            None => {
                ctx.remove(CURRENT_SESSION);
            }
        }
        Ok(())
    }
}
