// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use anyhow::Result;
use structopt::StructOpt;
use txscope_server::Opt;

#[tokio::main]
async fn main() -> Result<()> {
    let mut opt = Opt::from_args();
    if let Some(config) = opt.config.clone() {
        opt = Opt::from_file(&config).await?;
    }
    if opt.show_config {
        println!("{}", serde_json::to_string(&opt)?);
        return Ok(());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    txscope_server::run(opt).await
}
