use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::screen::{Region, JPEG_QUALITY};
use crate::stream::{StreamOptions, StreamResolution, DEFAULT_CRF, DEFAULT_FPS};

#[derive(Parser)]
#[command(name = "deskcast")]
#[command(about = "Screen capture and live screen streaming over WebSocket", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Encoder / device listing program
    #[arg(long, global = true, env = "DESKCAST_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// JPEG quality for still captures (1-100)
    #[arg(
        long,
        global = true,
        env = "DESKCAST_JPEG_QUALITY",
        default_value_t = JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub quality: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the WebSocket server for remote screenshots and live streaming
    Serve(ServeArgs),

    /// Capture the screen (or a region) to a JPEG file
    Screenshot {
        /// Region in physical pixels: x,y,width,height
        #[arg(short, long)]
        region: Option<Region>,

        /// Output file [default: screenshot-<UTC timestamp>.jpg]
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List capture devices
    Devices,

    /// Show primary display geometry and scaling
    Display,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, env = "DESKCAST_ADDR", default_value = "127.0.0.1:15800")]
    pub addr: String,

    /// Encoder frame rate
    #[arg(long, env = "DESKCAST_FPS", default_value_t = DEFAULT_FPS,
          value_parser = clap::value_parser!(u32).range(1..=240))]
    pub fps: u32,

    /// x264 CRF, lower = higher quality
    #[arg(long, env = "DESKCAST_CRF", default_value_t = DEFAULT_CRF,
          value_parser = clap::value_parser!(u8).range(0..=51))]
    pub crf: u8,

    /// Video device index [default: second enumerated video device]
    #[arg(short, long, env = "DESKCAST_DEVICE")]
    pub device: Option<u32>,

    /// Output size: logical, native or WxH
    #[arg(long, env = "DESKCAST_RESOLUTION", default_value = "logical")]
    pub resolution: StreamResolution,

    /// Do not capture the cursor and clicks
    #[arg(long)]
    pub no_cursor: bool,

    /// Send video chunks as binary WebSocket messages instead of JSON
    #[arg(long, env = "DESKCAST_BINARY_CHUNKS")]
    pub binary_chunks: bool,

    /// Start streaming immediately
    #[arg(long)]
    pub autostart: bool,
}

impl ServeArgs {
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            fps: self.fps,
            crf: self.crf,
            resolution: self.resolution,
            device_index: self.device,
            capture_cursor: !self.no_cursor,
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("deskcast").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_serve_defaults() {
        let cli = parse(&["serve"]);
        assert_eq!(cli.ffmpeg, "ffmpeg");
        assert_eq!(cli.quality, 80);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.addr, "127.0.0.1:15800");
        assert_eq!(args.stream_options(), StreamOptions::default());
    }

    #[test]
    fn test_serve_flags() {
        let cli = parse(&[
            "serve",
            "--fps",
            "15",
            "--crf",
            "30",
            "--device",
            "3",
            "--resolution",
            "1280x720",
            "--no-cursor",
            "--ffmpeg",
            "/opt/ffmpeg",
        ]);
        assert_eq!(cli.ffmpeg, "/opt/ffmpeg");
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let opts = args.stream_options();
        assert_eq!(opts.fps, 15);
        assert_eq!(opts.crf, 30);
        assert_eq!(opts.device_index, Some(3));
        assert!(!opts.capture_cursor);
        assert_eq!(
            opts.resolution,
            StreamResolution::Fixed {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let bad = |args: &[&str]| {
            Cli::try_parse_from(std::iter::once("deskcast").chain(args.iter().copied())).is_err()
        };
        assert!(bad(&["serve", "--crf", "52"]));
        assert!(bad(&["--quality", "0", "devices"]));
        assert!(bad(&["screenshot", "--region", "0,0,-5,10"]));
    }

    #[test]
    fn test_screenshot_region() {
        let cli = parse(&["screenshot", "-r", "10,20,300,200", "-o", "out.jpg"]);
        let Commands::Screenshot { region, output } = cli.command else {
            panic!("expected screenshot");
        };
        assert_eq!(region, Some(Region::new(10, 20, 300, 200).unwrap()));
        assert_eq!(output, Some(PathBuf::from("out.jpg")));
    }
}
