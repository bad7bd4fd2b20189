use anyhow::Context;
use clap::{Parser, Subcommand};
use khetworld_cache::{ContentCache, FileCache, MemoryCache};
use khetworld_common::{ClientConfig, Khet, KhetType, Pose, StoreId};
use khetworld_peer::{MemoryLink, PeerChannel, SessionConfig};
use khetworld_registry::{EntityRegistry, SourceMode};
use khetworld_transport::{
    CancellationToken, ChunkedTransport, MemoryAssetService, ServiceCall, TransportConfig,
};
use khetworld_world::{RecordingLoader, WorldReconciler};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "khetworld-cli", about = "CLI tool for khetworld operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Client config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the transfer chunk size, in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and effective configuration
    Info,
    /// Show entry count and disk usage of a content cache directory
    CacheStat {
        /// Cache directory; defaults to the configured one
        dir: Option<PathBuf>,
    },
    /// Upload and download an asset through an in-process asset service
    UploadDemo {
        /// Asset size in bytes
        #[arg(short, long, default_value = "4718592")]
        bytes: usize,
    },
    /// Replicate a host's khets to a joiner over an in-process link
    ReplicateDemo,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    config.validate()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Info => {
            println!("khetworld-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("world: {}", config.world_name);
            println!("chunk size: {} bytes", config.chunk_size);
            println!("max asset size: {} bytes", config.max_asset_bytes);
            println!("pose interval: {} ms", config.pose_interval_ms);
            match &config.cache_dir {
                Some(dir) => println!("cache: {}", dir.display()),
                None => println!("cache: in memory"),
            }
        }
        Commands::CacheStat { dir } => {
            let dir = dir
                .or_else(|| config.cache_dir.clone())
                .context("no cache directory given or configured")?;
            let cache = FileCache::open(&dir)?;
            let stats = cache.stats()?;
            println!("cache: {}", cache.root().display());
            println!("entries: {}", stats.entries);
            println!("bytes on disk: {}", stats.bytes_on_disk);
        }
        Commands::UploadDemo { bytes } => upload_demo(&config, bytes).await?,
        Commands::ReplicateDemo => match &config.cache_dir {
            Some(dir) => replicate_demo(&config, FileCache::open(dir)?).await?,
            None => replicate_demo(&config, MemoryCache::new()).await?,
        },
    }

    Ok(())
}

async fn upload_demo(config: &ClientConfig, bytes: usize) -> anyhow::Result<()> {
    let service = MemoryAssetService::new();
    let transport = ChunkedTransport::new(&service, TransportConfig::from(config))?;
    let cancel = CancellationToken::new();
    let store_id = config.store_id.unwrap_or_default();

    let asset: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    let khet = Khet::author(KhetType::SceneObject, asset);
    println!(
        "Uploading {} ({} bytes, chunk size {})",
        khet.id,
        bytes,
        transport.chunk_size()
    );

    let asset_ref = transport.upload(&khet, store_id, &cancel).await?;
    for call in service.calls() {
        match call {
            ServiceCall::StoreChunk { index, len, .. } => println!("  chunk {index}: {len} bytes"),
            ServiceCall::Finalize { chunk_count, .. } => println!("  finalize: {chunk_count} chunks"),
            _ => {}
        }
    }
    println!("Blob: {} ({} bytes)", asset_ref.blob_id, asset_ref.byte_length);

    let twin = Khet::author(KhetType::SceneObject, khet.asset_bytes.clone().unwrap_or_default());
    let twin_ref = transport.upload(&twin, store_id, &cancel).await?;
    println!(
        "Second upload of identical bytes: {} (dedup: {})",
        twin_ref.blob_id,
        twin_ref.blob_id == asset_ref.blob_id
    );

    let downloaded = transport.download(&asset_ref, &cancel).await?;
    println!(
        "Download: {} bytes, identical: {}",
        downloaded.len(),
        Some(&downloaded) == khet.asset_bytes.as_ref()
    );
    Ok(())
}

async fn replicate_demo<C: ContentCache>(config: &ClientConfig, cache: C) -> anyhow::Result<()> {
    let mut host_registry = EntityRegistry::new(SourceMode::LocalOnly);
    host_registry.insert(
        Khet::new("scene-fountain", KhetType::SceneObject)
            .with_asset(b"fountain mesh".to_vec())
            .with_position(glam::DVec3::new(4.0, 0.0, -2.0)),
    )?;
    host_registry.insert(
        Khet::new("crate-01", KhetType::MobileObject).with_asset(b"crate mesh".to_vec()),
    )?;
    host_registry.insert(Khet::new("host-avatar", KhetType::Avatar).with_asset(b"avatar".to_vec()))?;
    let host_cache = MemoryCache::new();

    let session = SessionConfig::from(config);
    let mut host = PeerChannel::new(session.clone());
    let mut joiner = PeerChannel::new(session);
    host.begin()?;
    host.assign_local_id("host")?;
    joiner.begin()?;
    joiner.assign_local_id("joiner")?;

    let (host_end, joiner_end) = MemoryLink::pair();
    host.accept(host_end, "joiner").await?;
    joiner.connect(joiner_end, "host").await?;

    let mut joiner_registry = EntityRegistry::new(SourceMode::PeerReplica);
    for event in joiner.next_event(&mut joiner_registry, &cache).await? {
        println!("joiner: {event:?}");
    }
    for event in host.next_event(&mut host_registry, &host_cache).await? {
        println!("host: {event:?}");
    }
    for event in joiner.next_event(&mut joiner_registry, &cache).await? {
        println!("joiner: {event:?}");
    }

    host.announce_avatar(&"host-avatar".into()).await?;
    host.send_pose(Pose::default(), tokio::time::Instant::now())
        .await?;
    for _ in 0..2 {
        for event in joiner.next_event(&mut joiner_registry, &cache).await? {
            println!("joiner: {event:?}");
        }
    }

    let mut world = WorldReconciler::new(RecordingLoader::new());
    let report = world.apply(&joiner_registry).await;
    println!(
        "Reconcile: to_load={:?} loaded={} failed={}",
        report.plan.to_load,
        report.loaded.len(),
        report.failed.len()
    );
    println!("Joiner cache entries: {}", cache.len());

    host.disconnect().await;
    let closing = joiner.next_event(&mut joiner_registry, &cache).await?;
    println!("joiner: {closing:?}");
    Ok(())
}
