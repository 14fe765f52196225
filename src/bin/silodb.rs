use std::path::PathBuf;

use anyhow::{bail, Error};

use silo_replication::{ClusterTransport, FileReplicationStore, Quorum};
use silo_storage::StorageEnvironment;

use silodb::config::NodeConfig;
use silodb::server::Server;
use silodb::shard::ShardQuorum;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let mut args = std::env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => bail!("usage: silodb <config.json>"),
    };

    let config = NodeConfig::load(&config_path)?;
    log::info!(
        "starting silodb node {} (quorum {})",
        config.node_id,
        config.quorum_id
    );

    let env = StorageEnvironment::open(config.storage_config())?;
    let store = FileReplicationStore::open(config.replication_dir())?;
    let quorum = Quorum::new(config.node_id, config.quorum_nodes());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let transport = ClusterTransport::start(config.transport_config()).await?;
        let quorum = ShardQuorum::new(
            config.quorum_id,
            quorum,
            config.track_id,
            config.lease_duration_ms,
            Box::new(store),
            env,
            0,
        )?;
        Server::new(transport, quorum).run().await
    })
}
