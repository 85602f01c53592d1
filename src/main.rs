//! bk-light: push text, counters and images to a BK-Light 32x32 panel.
//!
//! ```text
//! bk-light text "HI\n:)" --color "#00FF00"
//! bk-light image cat.png --mode fit --rotate 90
//! bk-light counter --start 0 --count 10 --interval 1.5
//! bk-light scan --seconds 8
//! ```
//!
//! The panel address comes from `--address` or `BK_LIGHT_ADDRESS`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::FutureExt;
use image::Rgb;
use log::{info, warn};

use bk_light::config::{address_from_env, resolve_address};
use bk_light::font::resolve_font;
use bk_light::render::{
    FitMode, ImageOptions, TextStyle, encode_png, load_image, parse_color, render_counter,
    render_text,
};
use bk_light::{BleTransport, DisplaySession, Result, SessionConfig, scan};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "bk-light", about = "Drive a BK-Light 32x32 LED panel over BLE")]
struct Cli {
    /// Panel address (falls back to BK_LIGHT_ADDRESS).
    #[arg(long, global = true)]
    address: Option<String>,

    /// Seconds to wait for each acknowledgment.
    #[arg(long, global = true, default_value = "5", value_parser = parse_seconds)]
    timeout: Duration,

    /// Seconds between protocol steps.
    #[arg(long, global = true, default_value = "0.2", value_parser = parse_seconds)]
    delay: Duration,

    /// Abort on the first missing acknowledgment.
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render text (use \n for line breaks).
    Text {
        text: String,
        #[arg(long, default_value = "#FF0000", value_parser = parse_rgb)]
        color: Rgb<u8>,
        #[arg(long, default_value = "#000000", value_parser = parse_rgb)]
        background: Rgb<u8>,
        /// TTF/OTF file (falls back to BK_LIGHT_FONT, then system fonts).
        #[arg(long)]
        font: Option<PathBuf>,
        #[arg(long, default_value_t = 16)]
        size: u32,
        #[arg(long, default_value_t = 1)]
        spacing: u32,
    },
    /// Send an image file, resized to 32x32.
    Image {
        image: PathBuf,
        /// scale, fit or cover.
        #[arg(long, default_value = "scale")]
        mode: FitMode,
        /// Degrees, counter-clockwise.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        rotate: i32,
        #[arg(long)]
        mirror: bool,
        #[arg(long)]
        invert: bool,
    },
    /// Count upwards, one transmission per value.
    Counter {
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        start: i64,
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Seconds between values.
        #[arg(long, default_value = "1.5", value_parser = parse_seconds)]
        interval: Duration,
        #[arg(long)]
        font: Option<PathBuf>,
    },
    /// List nearby panels.
    Scan {
        #[arg(long, default_value = "8", value_parser = parse_seconds)]
        seconds: Duration,
        /// Name prefix to filter on; empty lists everything.
        #[arg(long, default_value = bk_light::ble::DEVICE_NAME_PREFIX)]
        prefix: String,
    },
}

fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|e| format!("{value}: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{value}: {e}"))
}

fn parse_rgb(value: &str) -> std::result::Result<Rgb<u8>, String> {
    parse_color(value).map_err(|e| e.to_string())
}

// ── Commands ─────────────────────────────────────────────────────

async fn push_png(address: &str, config: SessionConfig, png: Vec<u8>) -> Result<()> {
    DisplaySession::scoped(BleTransport::new(), address, config, move |session| {
        async move {
            let report = session.send_image(&png).await?;
            if !report.is_clean() {
                warn!("transmission finished with missing acks: {report:?}");
            }
            Ok(())
        }
        .boxed()
    })
    .await
}

async fn run_counter(
    address: &str,
    config: SessionConfig,
    start: i64,
    count: u32,
    interval: Duration,
    font: Option<PathBuf>,
) -> Result<()> {
    let font = resolve_font(font.as_deref())?;
    DisplaySession::scoped(BleTransport::new(), address, config, move |session| {
        async move {
            for value in (start..).take(count as usize) {
                println!("SENDING {value}");
                let sent = match encode_png(&render_counter(value, &font)) {
                    Ok(png) => session.send_image(&png).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    println!("ERROR {value}: {e}");
                }
                tokio::time::sleep(interval).await;
            }
            Ok(())
        }
        .boxed()
    })
    .await
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Scan { seconds, prefix } = &cli.command {
        let prefix = (!prefix.is_empty()).then_some(prefix.as_str());
        info!("scanning for {seconds:?}");
        let devices = scan(*seconds, prefix).await?;
        if devices.is_empty() {
            println!("No matching BLE devices found.");
        }
        for device in devices {
            println!("- {}  name='{}'", device.id, device.name.unwrap_or_default());
        }
        return Ok(());
    }

    let address = resolve_address(cli.address.as_deref(), address_from_env().as_deref())?;
    let config = SessionConfig::default()
        .with_ack_timeout(cli.timeout)
        .with_pacing_delay(cli.delay)
        .with_strict(cli.strict);

    match cli.command {
        Command::Text {
            text,
            color,
            background,
            font,
            size,
            spacing,
        } => {
            let font = resolve_font(font.as_deref())?;
            let style = TextStyle {
                color,
                background,
                size: size as f32,
                spacing,
            };
            let png = encode_png(&render_text(&text, &style, &font))?;
            push_png(&address, config, png).await
        }
        Command::Image {
            image,
            mode,
            rotate,
            mirror,
            invert,
        } => {
            let options = ImageOptions {
                mode,
                rotate,
                mirror,
                invert,
            };
            let png = encode_png(&load_image(&image, &options)?)?;
            push_png(&address, config, png).await
        }
        Command::Counter {
            start,
            count,
            interval,
            font,
        } => run_counter(&address, config, start, count, interval, font).await,
        Command::Scan { .. } => Ok(()),
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let scanning = matches!(cli.command, Command::Scan { .. });

    match run(cli).await {
        Ok(()) => {
            if !scanning {
                println!("DONE");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("ERROR {e}");
            ExitCode::FAILURE
        }
    }
}
