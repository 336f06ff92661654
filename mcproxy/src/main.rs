// Copyright (C) 2026  mcproxy authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;

use mcproxy_logging::macros::*;

use mcproxy::config::Config;
use mcproxy::proxy::Proxy;
use mcproxy::server::ProxyServer;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "mcproxy",
    about = "Memcached-aware proxy: text-protocol clients over pooled binary backends"
)]
struct Opt {
    /// Configuration file path
    #[structopt(long = "conf", short = "c")]
    config: PathBuf,

    /// Override the listen address from the configuration file
    #[structopt(long)]
    listen: Option<String>,

    /// Override the downstream cluster from the configuration file
    #[structopt(long)]
    cluster: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = mcproxy_logging::setup_for_app(100);
    let opt = Opt::from_args();

    let raw = tokio::fs::read_to_string(&opt.config)
        .await
        .with_context(|| format!("Cannot read configuration file {}", opt.config.display()))?;
    let mut config: Config = toml::from_str(&raw).context("Invalid configuration file")?;
    if let Some(listen) = opt.listen {
        config.listen = listen;
    }
    if let Some(cluster) = opt.cluster {
        config.cluster = cluster;
    }

    info!(
        "starting proxy `{}`: {} -> {}",
        config.name, config.listen, config.cluster
    );

    let proxy = Arc::new(Proxy::new(
        config.name.clone(),
        config.listen.clone(),
        config.cluster.clone(),
        0,
        config.behavior,
    ));
    let server = ProxyServer::listen(proxy.clone()).await?;
    let quit = server.quit_channel();
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("Cannot listen for shutdown signal")?;
    info!("interrupted, shutting down");
    proxy.shutdown_config();
    let _ = quit.send(()).await;
    server_task.await.context("Server task failed")?;
    Ok(())
}
