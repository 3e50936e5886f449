// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::config::PersistenceConfig;
use crate::error::ScopeError;
use crate::session::{Session, SessionProvider};
use anyhow::{bail, Context, Result};
use async_lock::Mutex;
use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyConnection, AnyPool, AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, Transaction};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Session provider backed by one sqlx connection pool per persistence unit.
#[derive(Debug, Clone, Default)]
pub struct SqlProvider {
    units: BTreeMap<String, AnyPool>,
}

impl SqlProvider {
    /// Connects a pool for every unit in `config`.
    pub async fn connect(config: &PersistenceConfig) -> Result<Self> {
        let mut units = BTreeMap::new();
        for (name, unit) in config.units.iter() {
            let pool = AnyPoolOptions::new()
                .max_connections(unit.nr_connections as u32)
                .connect(&unit.db_uri)
                .await
                .with_context(|| format!("failed to connect to {}", unit.db_uri))?;
            info!("Persistence unit {:?} connected to {}", name, unit.db_uri);
            units.insert(name.clone(), pool);
        }
        Ok(Self { units })
    }

    pub fn from_pools<I: IntoIterator<Item = (String, AnyPool)>>(pools: I) -> Self {
        Self {
            units: pools.into_iter().collect(),
        }
    }

    pub fn pool(&self, unit: &str) -> Option<&AnyPool> {
        self.units.get(unit)
    }

    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(|k| k.as_str())
    }

    /// Closes every pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        for pool in self.units.values() {
            pool.close().await;
        }
    }
}

impl SessionProvider for SqlProvider {
    type Session = SqlSession;

    fn open(&self, unit: &str) -> Result<Arc<SqlSession>, ScopeError> {
        let pool = self
            .units
            .get(unit)
            .ok_or_else(|| ScopeError::NoPersistenceUnit(unit.into()))?;
        Ok(Arc::new(SqlSession::new(unit, pool.clone())))
    }
}

enum Conn {
    /// `None` until the first statement checks a connection out of the pool.
    Pooled(Option<PoolConnection<Any>>),
    Transaction(Transaction<'static, Any>),
    Closed,
}

/// Database session on a sqlx pool.
///
/// The session checks a connection out of the pool only when it is first used, either by a
/// statement or by beginning a transaction. Closing the session hands the connection back; a
/// transaction that is still open at that point is rolled back by sqlx.
pub struct SqlSession {
    unit: String,
    pool: AnyPool,
    conn: Mutex<Conn>,
    rollback_only: AtomicBool,
}

impl SqlSession {
    fn new(unit: &str, pool: AnyPool) -> Self {
        Self {
            unit: unit.into(),
            pool,
            conn: Mutex::new(Conn::Pooled(None)),
            rollback_only: AtomicBool::new(false),
        }
    }

    /// Executes a statement, returning the number of affected rows.
    pub async fn execute(&self, query: &SqlWithArguments) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let executor = self.executor(&mut conn).await?;
        let res = query
            .get_sqlx()
            .execute(executor)
            .await
            .with_context(|| format!("could not execute `{}`", query.sql))?;
        Ok(res.rows_affected())
    }

    pub async fn fetch_all(&self, query: &SqlWithArguments) -> Result<Vec<AnyRow>> {
        let mut conn = self.conn.lock().await;
        let executor = self.executor(&mut conn).await?;
        query
            .get_sqlx()
            .fetch_all(executor)
            .await
            .with_context(|| format!("could not fetch rows for `{}`", query.sql))
    }

    async fn executor<'c>(&self, conn: &'c mut Conn) -> Result<&'c mut AnyConnection> {
        match conn {
            Conn::Pooled(slot) => {
                let pooled = match slot.take() {
                    Some(pooled) => slot.insert(pooled),
                    None => slot.insert(
                        self.pool
                            .acquire()
                            .await
                            .context("could not acquire a database connection")?,
                    ),
                };
                Ok(&mut **pooled)
            }
            Conn::Transaction(txn) => Ok(&mut **txn),
            Conn::Closed => bail!("Session for unit {:?} is closed", self.unit),
        }
    }
}

#[async_trait]
impl Session for SqlSession {
    fn unit(&self) -> &str {
        &self.unit
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        match &*conn {
            Conn::Closed => bail!("Session for unit {:?} is closed", self.unit),
            Conn::Transaction(_) => {
                bail!("Cannot begin a transaction because another transaction is in progress")
            }
            Conn::Pooled(_) => {}
        }
        // give a checked-out connection back, the transaction brings its own
        *conn = Conn::Pooled(None);
        let txn = self
            .pool
            .begin()
            .await
            .context("could not begin an SQL transaction")?;
        *conn = Conn::Transaction(txn);
        self.rollback_only.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let txn = match std::mem::replace(&mut *conn, Conn::Pooled(None)) {
            Conn::Transaction(txn) => txn,
            other => {
                *conn = other;
                bail!("Cannot commit a transaction because no transaction is in progress");
            }
        };
        txn.commit().await.context("could not commit SQL transaction")
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let txn = match std::mem::replace(&mut *conn, Conn::Pooled(None)) {
            Conn::Transaction(txn) => txn,
            other => {
                *conn = other;
                bail!("Cannot rollback a transaction because no transaction is in progress");
            }
        };
        txn.rollback()
            .await
            .context("could not rollback SQL transaction")
    }

    async fn transaction_active(&self) -> bool {
        matches!(&*self.conn.lock().await, Conn::Transaction(_))
    }

    fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        let mut conn = self.conn.try_lock().context(
            "Cannot close a session because there is an operation in progress that uses it",
        )?;
        match std::mem::replace(&mut *conn, Conn::Closed) {
            Conn::Closed => bail!("Session for unit {:?} is already closed", self.unit),
            Conn::Transaction(txn) => {
                debug!("Discarding open transaction on unit {:?}", self.unit);
                // Drop the transaction, causing it to rollback.
                drop(txn);
            }
            Conn::Pooled(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_owned())
    }
}

/// An SQL string with placeholders, plus its argument values.  Keeps them all alive so they can be fed to
/// sqlx::Query by reference.
#[derive(Debug, Clone)]
pub struct SqlWithArguments {
    /// SQL query text with placeholders $1, $2, ...
    pub sql: String,
    /// Values for $n placeholders.
    pub args: Vec<SqlValue>,
}

impl SqlWithArguments {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_owned(),
            args: vec![],
        }
    }

    pub fn bind<V: Into<SqlValue>>(mut self, value: V) -> Self {
        self.args.push(value.into());
        self
    }

    fn get_sqlx(&self) -> sqlx::query::Query<'_, Any, AnyArguments> {
        let mut sqlx_query = sqlx::query(&self.sql);
        for arg in &self.args {
            match arg {
                SqlValue::Bool(arg) => sqlx_query = sqlx_query.bind(arg),
                SqlValue::I64(arg) => sqlx_query = sqlx_query.bind(arg),
                SqlValue::F64(arg) => sqlx_query = sqlx_query.bind(arg),
                SqlValue::String(arg) => sqlx_query = sqlx_query.bind(arg),
            };
        }
        sqlx_query
    }
}
