use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use image::{DynamicImage, ImageBuffer, ImageDecoder, ImageFormat, ImageReader};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tessera_core::config::{
    config_path, data_dir, initialize_data_dir, normalize_supported_locale, AppConfig,
};
use tessera_core::error::UpscaleError;
use tessera_core::geometry::TileConfig;
use tessera_core::logging::{self, FilterSource, LogPlan, LogSink, FALLBACK_FILTER};
use tessera_core::model_store::ModelLocator;
use tessera_core::pipeline::{Pipeline, Progress};
use tessera_core::runtime::{runtime_lib_status, RuntimeLibStatus};
use tessera_core::types::{Image, Orientation};

#[derive(Parser)]
#[command(name = "tessera", about = "Tiled super-resolution for still images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale one image file.
    Upscale(UpscaleArgs),
    /// Report model availability and runtime configuration.
    Status(StatusArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    input: PathBuf,
    output: PathBuf,
    #[arg(long, help = "Always tile, regardless of image size")]
    tiled: bool,
    #[arg(long, requires = "tiled")]
    tile_size: Option<u32>,
    #[arg(long, requires = "tiled")]
    overlap: Option<u32>,
    #[arg(long, requires = "tiled", help = "Output scale factor (defaults to the model's)")]
    scale: Option<u32>,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    tessera_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tessera_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, resolved_data_dir).await,
        Commands::Status(args) => run_status(args, &config, &resolved_data_dir),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let source = FilterSource::select(cli_log_filter, verbose, rust_log.as_deref());
    let LogPlan { filters, sink } = logging::plan_logging(data_dir, &source);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let console_only_reason = match sink {
        LogSink::Rolling { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            None
        }
        LogSink::ConsoleOnly { dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            Some((dir, reason))
        }
    };

    if let Some((dir, reason)) = console_only_reason {
        warn!(
            log_dir = ?dir,
            reason = %reason,
            "Log file unavailable, logging to the console only"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{FALLBACK_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(FALLBACK_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_upscale(args: UpscaleArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    if !args.input.is_file() {
        bail!("Input image does not exist: {}", args.input.display());
    }
    let locale = normalize_supported_locale(&config.locale);

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current tile");
            ctrl_c_token.cancel();
        }
    });

    let input_path = args.input.clone();
    let output_path = args.output.clone();
    let input = tokio::task::spawn_blocking(move || decode_image(&input_path))
        .await
        .context("image decoder task panicked")??;
    info!(
        width = input.width(),
        height = input.height(),
        channels = input.channels(),
        bit_depth = input.bit_depth(),
        "Loaded {}",
        args.input.display()
    );

    let task_token = cancel.clone();
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let pipeline = Pipeline::from_config(&config, &data_dir).with_cancellation(task_token);
        if let Some(notice) = pipeline.fallback_notice(&locale) {
            eprintln!("{notice}");
        }

        let mut on_fraction = |fraction: f32| print_progress(Progress::Fraction(fraction), started);
        let result = if args.tiled {
            let tiles = tile_config_for(&args, &config, &pipeline);
            info!(
                tile_size = tiles.tile_size,
                overlap = tiles.overlap,
                scale = tiles.scale_factor,
                "Tiled upscale requested"
            );
            pipeline.run_upscale_tiled(&input, &tiles, Some(&mut on_fraction))
        } else {
            pipeline.run_upscale_with_progress(&input, &mut |p| print_progress(p, started))
        };
        eprintln!();
        (result, input, locale)
    })
    .await
    .context("upscale task panicked")?;

    let (result, input, locale) = result;
    let output = match result {
        Ok(output) => output,
        Err(error) => {
            eprintln!("{}", error.user_message(&locale));
            return Err(anyhow::Error::new(error).context("upscale failed"));
        }
    };

    info!(
        input_width = input.width(),
        input_height = input.height(),
        output_width = output.width(),
        output_height = output.height(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Upscale finished"
    );

    let written = output_path.clone();
    tokio::task::spawn_blocking(move || encode_image(&output, &written))
        .await
        .context("image encoder task panicked")??;
    info!("Wrote {}", output_path.display());
    Ok(())
}

/// CLI overrides on top of the configured tiling; scale defaults to the
/// pipeline's (the model's when one is loaded).
fn tile_config_for(args: &UpscaleArgs, config: &AppConfig, pipeline: &Pipeline) -> TileConfig {
    let defaults = pipeline.settings().default_tiles;
    TileConfig::new(
        args.tile_size.unwrap_or(config.tiling.tile_size),
        args.overlap.unwrap_or(config.tiling.overlap),
        args.scale.unwrap_or(defaults.scale_factor),
    )
}

#[derive(Debug, Serialize)]
struct StatusReport {
    data_dir: PathBuf,
    config_path: PathBuf,
    locale: String,
    models_dir: PathBuf,
    model_available: bool,
    model: Option<PathBuf>,
    model_compiled: bool,
    compute_units: String,
    model_scale: u32,
    runtime: RuntimeLibStatus,
    fallback_notice: Option<String>,
}

fn build_status_report(config: &AppConfig, data_dir: &Path) -> StatusReport {
    let settings = config.inference_settings(data_dir);
    let locator = ModelLocator::from_settings(&settings);
    let model_available = locator.is_available();
    let asset = model_available.then(|| locator.resolve()).flatten();
    let locale = normalize_supported_locale(&config.locale);
    let fallback_notice = (!model_available)
        .then(|| tessera_core::error::fallback_disclaimer(&locale).to_string());

    StatusReport {
        data_dir: data_dir.to_path_buf(),
        config_path: config_path(data_dir),
        locale,
        models_dir: settings.models_dir.clone(),
        model_available,
        model_compiled: asset.as_ref().is_some_and(|a| a.is_compiled()),
        model: asset.map(|a| a.path().to_path_buf()),
        compute_units: settings.compute_units.to_string(),
        model_scale: settings.model_scale,
        runtime: runtime_lib_status(),
        fallback_notice,
    }
}

fn run_status(args: StatusArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let report = build_status_report(config, data_dir);
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize status")?
        );
        return Ok(());
    }

    println!("Data dir:      {}", report.data_dir.display());
    println!("Config:        {}", report.config_path.display());
    println!("Models dir:    {}", report.models_dir.display());
    match &report.model {
        Some(path) if report.model_compiled => println!("Model:         {} (compiled)", path.display()),
        Some(path) => println!("Model:         {}", path.display()),
        None => println!("Model:         <none>"),
    }
    println!("Compute units: {}", report.compute_units);
    println!("Model scale:   {}x", report.model_scale);
    match &report.runtime.ort_dylib {
        Some(path) if report.runtime.ort_dylib_exists => {
            println!("ORT library:   {}", path.display())
        }
        Some(path) => println!("ORT library:   {} (missing)", path.display()),
        None => println!("ORT library:   <default search path>"),
    }
    if let Some(notice) = &report.fallback_notice {
        println!();
        println!("{notice}");
    }
    Ok(())
}

fn decode_image(path: &Path) -> Result<Image> {
    let mut decoder = ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to detect image format: {}", path.display()))?
        .into_decoder()
        .with_context(|| format!("Unsupported image: {}", path.display()))?;
    let exif_orientation = decoder
        .orientation()
        .map(|o| o.to_exif())
        .unwrap_or(1);
    let decoded = DynamicImage::from_decoder(decoder)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;

    let orientation = Orientation::from_exif(exif_orientation).unwrap_or_default();
    Ok(dynamic_to_image(decoded)?.with_orientation(orientation))
}

fn dynamic_to_image(decoded: DynamicImage) -> Result<Image, UpscaleError> {
    let (width, height) = (decoded.width(), decoded.height());
    match decoded {
        DynamicImage::ImageLuma8(buf) => Image::from_raw(width, height, 1, 8, buf.into_raw()),
        DynamicImage::ImageLumaA8(buf) => Image::from_raw(width, height, 2, 8, buf.into_raw()),
        DynamicImage::ImageRgb8(buf) => Image::from_raw(width, height, 3, 8, buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => Image::from_raw(width, height, 4, 8, buf.into_raw()),
        DynamicImage::ImageLuma16(buf) => Image::from_raw(width, height, 1, 16, ne_bytes(buf.as_raw())),
        DynamicImage::ImageLumaA16(buf) => {
            Image::from_raw(width, height, 2, 16, ne_bytes(buf.as_raw()))
        }
        DynamicImage::ImageRgb16(buf) => Image::from_raw(width, height, 3, 16, ne_bytes(buf.as_raw())),
        DynamicImage::ImageRgba16(buf) => {
            Image::from_raw(width, height, 4, 16, ne_bytes(buf.as_raw()))
        }
        // Float images and anything newer: widest integer layout.
        other => Image::from_raw(width, height, 4, 16, ne_bytes(other.to_rgba16().as_raw())),
    }
}

fn ne_bytes(samples: &[u16]) -> Vec<u8> {
    samples.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn image_to_dynamic(image: &Image) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    let bytes = image.data().to_vec();
    let invalid = || anyhow::anyhow!("image buffer does not match its {width}x{height} layout");

    let dynamic = match (image.channels(), image.bit_depth()) {
        (1, 8) => DynamicImage::ImageLuma8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(invalid)?),
        (2, 8) => DynamicImage::ImageLumaA8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(invalid)?),
        (3, 8) => DynamicImage::ImageRgb8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(invalid)?),
        (4, 8) => DynamicImage::ImageRgba8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(invalid)?),
        (channels, 16) => {
            let samples: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|b| u16::from_ne_bytes([b[0], b[1]]))
                .collect();
            match channels {
                1 => DynamicImage::ImageLuma16(ImageBuffer::from_raw(width, height, samples).ok_or_else(invalid)?),
                2 => DynamicImage::ImageLumaA16(ImageBuffer::from_raw(width, height, samples).ok_or_else(invalid)?),
                3 => DynamicImage::ImageRgb16(ImageBuffer::from_raw(width, height, samples).ok_or_else(invalid)?),
                _ => DynamicImage::ImageRgba16(ImageBuffer::from_raw(width, height, samples).ok_or_else(invalid)?),
            }
        }
        (channels, depth) => bail!("unsupported output layout: {channels} channels @ {depth}-bit"),
    };
    Ok(dynamic)
}

/// Bakes the EXIF orientation into the pixels, since the encoders don't carry
/// the tag through.
fn encode_image(image: &Image, path: &Path) -> Result<()> {
    let mut dynamic = image_to_dynamic(image)?;
    if let Some(orientation) = image::metadata::Orientation::from_exif(image.orientation().to_exif()) {
        dynamic.apply_orientation(orientation);
    }

    let format = ImageFormat::from_path(path)
        .with_context(|| format!("Unknown output format: {}", path.display()))?;
    let dynamic = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(dynamic.to_rgb8()),
        _ => dynamic,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    dynamic
        .save_with_format(path, format)
        .with_context(|| format!("Failed to write image: {}", path.display()))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress_bar(fraction: f32) -> String {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f32).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    format!(
        "[{}{}] {:5.1}%",
        "█".repeat(filled),
        "░".repeat(empty),
        fraction * 100.0
    )
}

fn print_progress(progress: Progress, started: Instant) {
    let elapsed = format_duration(started.elapsed().as_secs_f64());
    match progress {
        Progress::Fraction(fraction) => {
            eprint!("\r{} | Elapsed: {elapsed}    ", render_progress_bar(fraction))
        }
        Progress::Indeterminate => eprint!("\rUpscaling... | Elapsed: {elapsed}    "),
    }
}


#[cfg(test)]
mod progress_bar_tests {
    use super::*;

    #[test]
    fn empty_and_full_bars() {
        assert_eq!(
            render_progress_bar(0.0),
            format!("[{}]   0.0%", "░".repeat(PROGRESS_BAR_WIDTH))
        );
        assert_eq!(
            render_progress_bar(1.0),
            format!("[{}] 100.0%", "█".repeat(PROGRESS_BAR_WIDTH))
        );
    }

    #[test]
    fn out_of_range_fractions_are_clamped() {
        assert_eq!(render_progress_bar(1.7), render_progress_bar(1.0));
        assert_eq!(render_progress_bar(-0.2), render_progress_bar(0.0));
        assert_eq!(render_progress_bar(f32::NAN), render_progress_bar(0.0));
    }

    #[test]
    fn half_bar() {
        let bar = render_progress_bar(0.5);
        assert_eq!(bar.matches('█').count(), PROGRESS_BAR_WIDTH / 2);
        assert!(bar.ends_with(" 50.0%"));
    }
}
