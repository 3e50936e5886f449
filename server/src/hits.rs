// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Hit counter endpoints, the demo workload of `txscoped`.
//!
//! `GET /hits` lists all counters in a read-only scope. `POST /hits/<name>` bumps one counter in a
//! read-write scope; with `?rollback=1` the handler marks the session rollback-only, so the
//! response shows the bumped value but nothing is committed.

use crate::bad_request;
use crate::error::ResultExt;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::Method;
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::Arc;
use txscope::{
    JobContext, Session, SqlProvider, SqlSession, SqlWithArguments, Transactional,
    TransactionScope, TransactionalAction,
};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS hits (name TEXT PRIMARY KEY, count BIGINT NOT NULL)";
const UPSERT: &str =
    "INSERT INTO hits (name, count) VALUES ($1, 1) ON CONFLICT (name) DO UPDATE SET count = hits.count + 1";

pub type Scope = TransactionScope<SqlProvider>;
pub type Handler = fn(JobContext<SqlSession>) -> BoxFuture<'static, Result<Value>>;
pub type Action = TransactionalAction<SqlProvider, Handler>;

/// Creates the `hits` table on the default unit, outside of any request.
pub async fn create_schema(scope: &Scope) -> Result<()> {
    let unit = scope.config().default_unit.as_str();
    let session = scope.current_session(&JobContext::Background, Some(unit))?;
    let res = session.execute(&SqlWithArguments::new(CREATE_TABLE)).await;
    session.close()?;
    res.map(|_| ())
}

pub struct Routes {
    list: Action,
    bump: Action,
}

impl Routes {
    pub fn new(scope: Arc<Scope>) -> Self {
        let unit = scope.config().default_unit.clone();
        let list = TransactionalAction::new(
            scope.clone(),
            Transactional::new(&unit).with_read_only(true),
            list_hits as Handler,
        );
        let bump = TransactionalAction::new(scope, Transactional::new(&unit), bump_hit as Handler);
        Self { list, bump }
    }

    pub fn find(&self, method: &Method, path: &str) -> Option<&Action> {
        if *method == Method::GET && path == "/hits" {
            Some(&self.list)
        } else if *method == Method::POST && path.starts_with("/hits/") {
            Some(&self.bump)
        } else {
            None
        }
    }
}

fn list_hits(ctx: JobContext<SqlSession>) -> BoxFuture<'static, Result<Value>> {
    list(ctx).boxed()
}

fn bump_hit(ctx: JobContext<SqlSession>) -> BoxFuture<'static, Result<Value>> {
    bump(ctx).boxed()
}

async fn list(ctx: JobContext<SqlSession>) -> Result<Value> {
    let session = ctx.bound_session()?;
    let rows = session
        .fetch_all(&SqlWithArguments::new(
            "SELECT name, count FROM hits ORDER BY name",
        ))
        .await?;
    let mut hits = serde_json::Map::new();
    for row in rows {
        let name: String = row.try_get("name").err_internal()?;
        let count: i64 = row.try_get("count").err_internal()?;
        hits.insert(name, count.into());
    }
    Ok(Value::Object(hits))
}

async fn bump(ctx: JobContext<SqlSession>) -> Result<Value> {
    let meta = ctx
        .carrier()
        .context("hits can only be counted for HTTP requests")?
        .meta()
        .clone();
    let name = meta.path.strip_prefix("/hits/").unwrap_or_default();
    if !is_valid_name(name) {
        bad_request!("invalid counter name {:?}", name);
    }
    let rollback = rollback_requested(meta.query.as_deref())?;

    let session = ctx.bound_session()?;
    session
        .execute(&SqlWithArguments::new(UPSERT).bind(name))
        .await?;
    let rows = session
        .fetch_all(&SqlWithArguments::new("SELECT count FROM hits WHERE name = $1").bind(name))
        .await?;
    let count: i64 = rows
        .first()
        .with_context(|| format!("counter {:?} vanished", name))?
        .try_get("count")
        .err_internal()?;
    if rollback {
        session.set_rollback_only();
    }

    Ok(json!({
        "name": name,
        "count": count,
        "committed": !rollback,
    }))
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn rollback_requested(query: Option<&str>) -> Result<bool> {
    let query = match query {
        Some(query) => query,
        None => return Ok(false),
    };
    let mut rollback = false;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key != "rollback" {
            continue;
        }
        rollback = match value.as_ref() {
            "1" | "true" => true,
            "0" | "false" => false,
            other => bad_request!("invalid value {:?} for rollback", other),
        };
    }
    Ok(rollback)
}
