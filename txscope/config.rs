// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persistence unit used when a caller does not name one.
pub const DEFAULT_UNIT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScopeConfig {
    /// Unit used by `TransactionScope::with_transaction`.
    pub default_unit: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            default_unit: DEFAULT_UNIT.into(),
        }
    }
}

/// Persistence units known to a `SqlProvider`, keyed by unit name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PersistenceConfig {
    pub units: BTreeMap<String, UnitConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    /// Database URI, e.g. `sqlite://.txscoped.db?mode=rwc` or `postgres://...`.
    pub db_uri: String,
    /// size of database connection pool.
    #[serde(default = "default_nr_connections")]
    pub nr_connections: usize,
}

fn default_nr_connections() -> usize {
    10
}

impl PersistenceConfig {
    pub fn single(unit: &str, db_uri: &str, nr_connections: usize) -> Self {
        let mut units = BTreeMap::new();
        units.insert(
            unit.to_owned(),
            UnitConfig {
                db_uri: db_uri.to_owned(),
                nr_connections,
            },
        );
        Self { units }
    }
}
