// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::api;
use crate::hits::{self, Routes, Scope};
use crate::opt::Opt;
use anyhow::{Context, Result};
use std::sync::Arc;
use txscope::SqlProvider;

/// Runs `txscoped` until it receives Ctrl-C.
///
/// The session provider is connected and installed before the API starts listening, and it is
/// taken out of the scope again before its pools are closed.
pub async fn run(opt: Opt) -> Result<()> {
    let provider = SqlProvider::connect(&opt.persistence_config()).await?;
    let scope = Arc::new(Scope::with_provider(opt.scope_config(), Arc::new(provider)));
    hits::create_schema(&scope)
        .await
        .context("could not create the hits table")?;

    let routes = Arc::new(Routes::new(scope.clone()));
    let (addrs, mut task) = api::spawn(routes, opt.api_listen_addr.clone()).await?;
    for addr in addrs.iter() {
        info!("API server listening on {}", addr);
    }

    tokio::select! {
        res = &mut task => res.context("API server task failed")??,
        res = tokio::signal::ctrl_c() => {
            res.context("could not listen for Ctrl-C")?;
            info!("Got Ctrl-C, shutting down");
        }
    }
    task.abort();

    if let Some(provider) = scope.shutdown() {
        provider.close().await;
    }
    Ok(())
}
