use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;

use crate::{auth::TokenAuth, config::Config, service::Service, web::LiveServer};

/// Run the review service: worker pools plus the HTTP API.
#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// Path to the service configuration file.
    pub config: PathBuf,

    /// The IP address to listen on. Overrides the config.
    #[clap(long)]
    pub address: Option<IpAddr>,

    /// The port to listen on. Overrides the config.
    #[clap(long)]
    pub port: Option<u16>,

    /// [DEV] Skip the indexer during setup.
    #[clap(long)]
    pub skip_index: bool,

    /// [DEV] Keep work-tree snapshots after review for debugging.
    #[clap(long)]
    pub keep_snapshots: bool,
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let mut config = Config::load(&self.config)?;

        if self.skip_index && config.indexer.take().is_some() {
            log::info!("Skipping indexer (--skip-index)");
        }
        if self.keep_snapshots {
            config.keep_snapshots = true;
        }

        let address: SocketAddr = (
            self.address.unwrap_or(config.bind_address),
            self.port.unwrap_or(config.port),
        )
            .into();

        let auth = Arc::new(TokenAuth::load(&config.token_db)?);
        let service = Arc::new(Service::new(config)?);
        service.start()?;

        LiveServer::new(service, auth).start(address)
    }
}
