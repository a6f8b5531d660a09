use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use couch_push_replicator::{
    never_stop, BasicAuthorizer, HttpTransport, MemoryStore, PushReplicator, ReplicatorConfig,
};
use eyre::{eyre, Result};

#[derive(Parser, Debug)]
#[command(
    name = "push-replicator",
    version,
    about = "CouchDB-compatible push replicator"
)]
struct Args {
    /// Remote database root URL, e.g. http://localhost:5984/mydb/
    #[arg(long)]
    remote_url: String,

    /// Basic auth username. If omitted, requests are sent unauthenticated.
    #[arg(long)]
    username: Option<String>,

    /// Environment variable name holding the basic auth password.
    #[arg(long, default_value = "PUSH_REPLICATOR_PASSWORD")]
    password_env: String,

    /// Where to mirror the replication checkpoint locally.
    #[arg(long, default_value = "push-replicator/checkpoint.json")]
    checkpoint_file: PathBuf,

    /// Max revisions collected into one _revs_diff/_bulk_docs round.
    #[arg(long, default_value_t = 100)]
    batch_capacity: usize,

    /// Max time (ms) a partial batch waits before it is flushed anyway.
    #[arg(long, default_value_t = 500)]
    batch_timeout_ms: u64,

    /// Keep watching the local change feed after the backlog drains.
    #[arg(long)]
    continuous: bool,

    /// Give up after this many consecutive cycle failures.
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// Base retry backoff in milliseconds.
    #[arg(long, default_value_t = 500)]
    retry_base_delay_ms: u64,

    /// Maximum retry backoff in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    retry_max_delay_ms: u64,

    /// Identity seed used to derive the remote checkpoint document ID.
    /// Should be stable across restarts of the same (source, target) pair.
    #[arg(long, default_value = "push-replicator:default")]
    replication_id_seed: String,

    /// Create the target database (`PUT /`) before replicating, if it
    /// doesn't already exist.
    #[arg(long)]
    create_target: bool,

    /// Name of a filter registered on the local store to resolve before
    /// replication starts. The bundled demo store has no filters
    /// registered, so this only matters for a custom `ChangeSource`.
    #[arg(long)]
    filter_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let remote_url = reqwest::Url::parse(&args.remote_url)
        .map_err(|e| eyre!("invalid --remote-url {:?}: {e}", args.remote_url))?;

    let mut config = ReplicatorConfig::new(
        remote_url.clone(),
        args.checkpoint_file,
        args.batch_capacity,
        args.batch_timeout_ms,
        args.continuous,
        args.max_retries,
        args.retry_base_delay_ms,
        args.retry_max_delay_ms,
        args.replication_id_seed,
    )?
    .with_create_target(args.create_target);

    if let Some(filter_name) = args.filter_name {
        config = config.with_filter_name(filter_name);
    }

    let authorizer = match args.username {
        Some(username) => {
            let password = std::env::var(&args.password_env).map_err(|_| {
                eyre!(
                    "missing password env var '{}'. Set it in your shell before running.",
                    args.password_env
                )
            })?;
            Some(Arc::new(BasicAuthorizer { username, password }) as Arc<dyn couch_push_replicator::Authorizer>)
        }
        None => None,
    };

    let transport = Arc::new(HttpTransport::new(remote_url, authorizer));
    let store = Arc::new(MemoryStore::new());

    tracing::info!(
        remote = %config.remote_url,
        checkpoint_file = %config.checkpoint_file.display(),
        continuous = config.continuous,
        "push replicator starting"
    );

    let replicator = PushReplicator::new(config, store.clone(), store, transport, None);
    replicator.run(never_stop()).await?;

    tracing::info!("push replicator finished");
    Ok(())
}
