use async_mica::AsyncExecutor;
use clap::Parser;
use resource_mica::{BlobLoader, JsonResource, ResourceConfig, ResourceLoaders, ResourceManager, ResourcePriority};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use watch_mica::HotReloadWatcher;

#[derive(Parser, Debug)]
#[command(name = "sandbox", about = "Drives the resource cache against a data directory")]
struct CliArgs
{
    /// directory of <guid>.res files, including the nickname table
    #[arg(long, default_value = "data")]
    data_root: PathBuf,

    /// how many frames to pump before exiting
    #[arg(long, default_value_t = 600)]
    frames: u32,

    /// a nicknamed json resource to load and report on
    #[arg(long)]
    nickname: Option<String>,

    #[arg(long, default_value_t = 2)]
    async_workers: usize,
}

fn main()
{
    let args = CliArgs::parse();

    colog::basic_builder()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("sandbox_mica", log::LevelFilter::Debug)
        .filter_module("resource_mica", log::LevelFilter::Debug)
        .filter_module("async_mica", log::LevelFilter::Debug)
        .filter_module("watch_mica", log::LevelFilter::Debug)
        .init();

    log::debug!("Serving resources from {:?}", args.data_root);

    let executor = Arc::new(AsyncExecutor::new(args.async_workers));
    let watcher = HotReloadWatcher::new(&args.data_root);

    let mut manager = ResourceManager::new(
        executor.clone(),
        ResourceLoaders::default().register(BlobLoader),
        ResourceConfig { data_root: args.data_root.clone() });
    manager.enable_hot_reload(watcher.register_category());

    let handle = args.nickname.as_deref()
        .and_then(|nickname| manager.get_or_load::<JsonResource>(nickname, ResourcePriority::Foreground));

    let mut reported = false;
    for _ in 0..args.frames
    {
        manager.poll();

        if let Some(handle) = &handle
        {
            if handle.is_ready() && !reported
            {
                reported = true;
                match handle.payload()
                {
                    Some(payload) if handle.is_valid() =>
                        log::info!("{handle:?} ready with {} top-level entr(ies)", payload.entries().count()),
                    _ => log::warn!("{handle:?} settled but is unusable"),
                }
            }
        }

        std::thread::sleep(Duration::from_millis(16));
    }

    drop(handle);
    manager.poll(); // final collection before teardown
    drop(manager);
    executor.shutdown();
}
