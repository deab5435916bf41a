use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use chunkstore::prelude::*;
use chunkstore::server;

#[derive(Debug, Parser)]
#[command(name = "chunkstore")]
#[command(about = "Content-addressed chunk store with a compare-and-swap root", version)]
struct Cli {
    /// Server used by the client commands.
    #[arg(
        long,
        global = true,
        env = "CHUNKSTORE_REMOTE",
        default_value = "http://127.0.0.1:8000/"
    )]
    remote: Url,

    #[command(flatten)]
    batch: BatchArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct BatchArgs {
    /// Most hashes fetched by one read request.
    #[arg(long, global = true, default_value_t = BatchConfig::default().read_batch_size)]
    read_batch_size: usize,
    /// Staged chunks that trigger a write request.
    #[arg(long, global = true, default_value_t = BatchConfig::default().write_batch_size)]
    write_batch_size: usize,
    #[arg(long, global = true, default_value_t = BatchConfig::default().max_reads)]
    max_reads: usize,
    #[arg(long, global = true, default_value_t = BatchConfig::default().max_writes)]
    max_writes: usize,
}

impl From<&BatchArgs> for BatchConfig {
    fn from(args: &BatchArgs) -> Self {
        BatchConfig {
            read_batch_size: args.read_batch_size,
            write_batch_size: args.write_batch_size,
            max_reads: args.max_reads,
            max_writes: args.max_writes,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a store over HTTP.
    Serve {
        /// Backing object store, e.g. `memory:///`, `file:///srv/chunks/` or `s3://bucket/prefix`.
        #[arg(long, env = "CHUNKSTORE_STORE", default_value = "memory:///")]
        store: Url,
        #[arg(long, env = "CHUNKSTORE_BIND", default_value = "127.0.0.1:8000")]
        bind: SocketAddr,
        /// Keep the root in process memory, for backends without conditional writes.
        #[arg(long)]
        memory_root: bool,
    },
    /// Store files (or stdin) as chunks and print their hashes.
    Put { files: Vec<PathBuf> },
    /// Print a chunk to stdout or to a file.
    Get {
        hash: Hash,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the current root.
    Root,
    /// Move the root to `current` if it still is `last`.
    SetRoot {
        current: Hash,
        /// Expected root, defaults to the root read just before the update.
        #[arg(long)]
        last: Option<Hash>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = BatchConfig::from(&cli.batch);

    match cli.command {
        Command::Serve {
            store,
            bind,
            memory_root,
        } => serve(store, bind, memory_root).await,
        command => {
            let remote = BatchStore::new(HttpStore::new(cli.remote.clone()), config);
            run(&remote, command).await?;
            let stats = remote.close().await?;
            info!(%stats, remote = %cli.remote, "done");
            Ok(())
        }
    }
}

async fn serve(url: Url, bind: SocketAddr, memory_root: bool) -> Result<()> {
    let chunks = ObjectStoreRemote::with_url(&url)
        .with_context(|| format!("failed to open object store {url}"))?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(store = %url, memory_root, "opened store");
    if memory_root {
        let store = HybridStore::new(chunks, MemoryStore::new());
        server::serve(listener, Arc::new(store)).await?;
    } else {
        server::serve(listener, Arc::new(chunks)).await?;
    }
    Ok(())
}

async fn run(remote: &BatchStore<HttpStore>, command: Command) -> Result<()> {
    match command {
        Command::Serve { .. } => bail!("`serve` does not talk to a remote"),
        Command::Put { files } => {
            if files.is_empty() {
                let mut data = Vec::new();
                std::io::stdin()
                    .read_to_end(&mut data)
                    .context("failed to read stdin")?;
                put(remote, data);
            }
            for file in files {
                let data = std::fs::read(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                put(remote, data);
            }
            remote.flush().await?;
        }
        Command::Get { hash, output } => {
            let chunk = remote.get(&hash).await;
            if chunk.is_empty() && hash != chunk.hash() {
                bail!("{hash} not found on {}", remote.store().base());
            }
            match output {
                Some(path) => std::fs::write(&path, chunk.data())
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(chunk.data())?,
            }
        }
        Command::Root => println!("{}", remote.root().await?),
        Command::SetRoot { current, last } => {
            let last = match last {
                Some(last) => last,
                None => remote.root().await?,
            };
            if !remote.update_root(current, last).await? {
                bail!(
                    "root moved, expected {last} but it is {}",
                    remote.root().await?
                );
            }
            println!("{current}");
        }
    }
    Ok(())
}

fn put(remote: &BatchStore<HttpStore>, data: Vec<u8>) {
    let chunk = Chunk::new(data);
    println!("{}", chunk.hash());
    remote.schedule_put(chunk, []);
}
