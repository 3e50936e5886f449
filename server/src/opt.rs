// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use structopt_toml::StructOptToml;
use txscope::{PersistenceConfig, ScopeConfig};

#[derive(StructOpt, Debug, Clone, StructOptToml, Deserialize, Serialize)]
#[structopt(name = "txscoped")]
#[serde(deny_unknown_fields, default)]
pub struct Opt {
    /// user-visible API server listen address.
    #[structopt(short, long, default_value = "localhost:8080")]
    pub api_listen_addr: String,
    /// Database URI of the default persistence unit.
    #[structopt(long, default_value = "sqlite://.txscoped.db?mode=rwc")]
    pub db_uri: String,
    /// size of database connection pool.
    #[structopt(short, long, default_value = "10")]
    pub nr_connections: usize,
    /// Persistence unit the endpoints open their sessions on.
    #[structopt(long, default_value = "default")]
    pub default_unit: String,
    /// Read default configuration from this toml configuration file
    #[structopt(long, short)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Prints the configuration resulting from the merging of all the configuration sources,
    /// including default values, in the JSON format.
    #[structopt(long)]
    #[serde(skip)]
    pub show_config: bool,
}

impl Opt {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await?;
        let content = std::str::from_utf8(&content)?;

        Self::from_args_with_toml(content).map_err(|e| anyhow!(e.to_string()))
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig::single(&self.default_unit, &self.db_uri, self.nr_connections)
    }

    pub fn scope_config(&self) -> ScopeConfig {
        ScopeConfig {
            default_unit: self.default_unit.clone(),
        }
    }
}
