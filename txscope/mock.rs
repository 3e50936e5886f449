// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Recording session provider for unit tests.

use crate::error::ScopeError;
use crate::session::{Session, SessionProvider};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Begin,
    Commit,
    Rollback,
    Close,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub begin: bool,
    pub commit: bool,
    pub rollback: bool,
    pub close: bool,
}

pub struct MockProvider {
    units: Vec<String>,
    faults: Faults,
    log: Arc<Mutex<Vec<Event>>>,
    opened: AtomicUsize,
}

impl MockProvider {
    pub fn new(units: &[&str]) -> Self {
        Self::with_faults(units, Faults::default())
    }

    pub fn with_faults(units: &[&str], faults: Faults) -> Self {
        Self {
            units: units.iter().map(|u| u.to_string()).collect(),
            faults,
            log: Default::default(),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SessionProvider for MockProvider {
    type Session = MockSession;

    fn open(&self, unit: &str) -> Result<Arc<MockSession>, ScopeError> {
        if !self.units.iter().any(|u| u == unit) {
            return Err(ScopeError::NoPersistenceUnit(unit.into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            unit: unit.into(),
            faults: self.faults,
            log: self.log.clone(),
            active: AtomicBool::new(false),
            rollback_only: AtomicBool::new(false),
        }))
    }
}

pub struct MockSession {
    unit: String,
    faults: Faults,
    log: Arc<Mutex<Vec<Event>>>,
    active: AtomicBool,
    rollback_only: AtomicBool,
}

impl MockSession {
    fn record(&self, event: Event) {
        self.log.lock().push(event);
    }
}

#[async_trait]
impl Session for MockSession {
    fn unit(&self) -> &str {
        &self.unit
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.record(Event::Begin);
        if self.faults.begin {
            bail!("begin failed");
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.record(Event::Commit);
        if self.faults.commit {
            bail!("commit failed");
        }
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.record(Event::Rollback);
        self.active.store(false, Ordering::SeqCst);
        if self.faults.rollback {
            bail!("rollback failed");
        }
        Ok(())
    }

    async fn transaction_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.record(Event::Close);
        if self.faults.close {
            bail!("close failed");
        }
        Ok(())
    }
}
