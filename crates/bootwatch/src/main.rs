use bootwatch::{
    cli::Args,
    gate::{GateConfig, prepare_power_on},
    tracing_init::init_tracing,
    watch::{watch_addr, watch_path},
};
use bootwatch_common::{Shutdown, spawn_named};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        init_tracing(&args)?;
        run(args).await
    })
}

async fn run(args: Args) -> eyre::Result<()> {
    let shutdown = Shutdown::new();
    let on_signal = shutdown.clone();
    spawn_named("ctrl-c", async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c, shutting down");
                on_signal.trigger();
            }
            Err(e) => error!(error = %e, "could not listen for ctrl-c"),
        }
    });

    match args {
        Args::Gate { symlink_path, .. } => {
            let config = GateConfig { symlink_path };
            let outcome = prepare_power_on(&config, &shutdown).await?;
            info!(
                control_plane = %outcome.control_plane,
                exclusive = %outcome.exclusive,
                "boot gate passed"
            );
        }
        Args::WatchPath { dir, .. } => watch_path(&dir, &shutdown).await?,
        Args::WatchAddr { .. } => watch_addr(&shutdown).await?,
    }
    Ok(())
}
