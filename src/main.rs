mod cli;
mod devices;
mod display;
mod error;
mod external;
mod protocol;
mod relay;
mod screen;
mod stream;

use anyhow::{Context, Result};
use cli::{Cli, Commands, ServeArgs};
use devices::{list_devices, DeviceKind};
use display::DisplayResolver;
use external::ExternalCommand;
use relay::server::CastServer;
use screen::capture::ScreenCapturer;
use screen::source::ScrapSource;
use screen::{EncodedImage, Region, ScreenshotOutput};
use std::path::PathBuf;
use std::sync::Arc;
use stream::StreamManager;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    let encoder = ExternalCommand::new(&cli.ffmpeg);

    match cli.command {
        Commands::Serve(args) => serve(args, encoder, cli.quality).await?,
        Commands::Screenshot { region, output } => {
            screenshot(region, output, cli.quality).await?;
        }
        Commands::Devices => show_devices(&encoder).await?,
        Commands::Display => show_display().await,
    }

    Ok(())
}

async fn serve(args: ServeArgs, encoder: ExternalCommand, quality: u8) -> Result<()> {
    let manager = StreamManager::new(encoder, DisplayResolver::default(), args.stream_options());
    let server = CastServer::new(args.addr, manager, capturer(quality))
        .binary_chunks(args.binary_chunks)
        .autostart(args.autostart);

    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            // Runtime shutdown drops the encoder child, which is kill_on_drop.
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

fn capturer(quality: u8) -> ScreenCapturer {
    ScreenCapturer::new(Arc::new(ScrapSource::default()), DisplayResolver::default())
        .with_quality(quality)
}

async fn screenshot(region: Option<Region>, output: Option<PathBuf>, quality: u8) -> Result<()> {
    let path = output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "screenshot-{}.jpg",
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
        ))
    });

    let shot = capturer(quality)
        .capture_screenshot(region, &ScreenshotOutput::File(path))
        .await
        .context("Screenshot failed")?;

    if let EncodedImage::File(path) = &shot.image {
        println!("{}", path.display());
    }
    println!(
        "{}x{} logical, {}x{} physical, scale {}x{}",
        shot.logical_width,
        shot.logical_height,
        shot.physical_width,
        shot.physical_height,
        shot.scaling.scale_x,
        shot.scaling.scale_y
    );
    Ok(())
}

async fn show_devices(encoder: &ExternalCommand) -> Result<()> {
    let devices = list_devices(encoder)
        .await
        .context("Failed to list capture devices")?;

    for kind in [DeviceKind::Video, DeviceKind::Audio] {
        println!("{:?} devices:", kind);
        for device in devices.iter().filter(|d| d.kind == kind) {
            println!("  {}", device);
        }
    }
    Ok(())
}

async fn show_display() {
    let info = DisplayResolver::default().resolve().await;
    match info.primary {
        Some(primary) => {
            if let Some(name) = &primary.name {
                println!("{}", name);
            }
            println!(
                "{}x{} logical, {}x{} physical",
                primary.logical.width,
                primary.logical.height,
                primary.physical.width,
                primary.physical.height
            );
        }
        None => println!("Primary display unknown"),
    }
    println!("scale {}x{}", info.scaling.scale_x, info.scaling.scale_y);
}
