use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use portrait_core::detector::{self, FaceDetector};
use portrait_core::{
    resolve_variants, CancelHandle, DetectionCache, FileCache, GenerateError, GenerateOptions, NoFaceAnchor,
    OutputFormat, PortraitGenerator, ProfileMode, RunSummary, SizeProfile, SizeRequest,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod roster;

use config::Config;

#[derive(Parser)]
#[command(name = "portraitgen", version, about = "Generate standardized portraits for a roster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate portraits for every identity in a roster
    Generate(GenerateArgs),
    /// Load and validate a size profile
    ValidateProfile {
        /// Profile file (.json or .toml)
        profile: PathBuf,
    },
    /// Run one detection and print the landmarks as JSON
    Detect {
        /// Photo to analyze
        photo: PathBuf,
        /// Detector chain (e.g. "ollama:llava,yolo,center")
        #[arg(long)]
        detector: Option<String>,
    },
}

#[derive(Args)]
struct GenerateArgs {
    /// Roster file (.json or .csv)
    #[arg(long)]
    roster: PathBuf,
    /// Output directory
    #[arg(short, long)]
    output: PathBuf,
    /// Single output size, e.g. 200x300
    #[arg(long, value_parser = parse_size, required_unless_present = "profile", conflicts_with = "profile")]
    size: Option<Size>,
    /// Size profile file (.json or .toml)
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Generate every variant of the profile, one subfolder each
    #[arg(long, requires = "profile")]
    all_variants: bool,
    /// Placeholder image for identities without a photo (single size only)
    #[arg(long, conflicts_with = "profile")]
    placeholder: Option<PathBuf>,
    /// Output format: jpg, png or bmp
    #[arg(long, default_value = "jpg")]
    format: OutputFormat,
    /// JPEG quality (1-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: Option<u8>,
    /// Detector chain, comma separated; the first backend that initializes is used
    #[arg(long)]
    detector: Option<String>,
    /// Identities processed concurrently
    #[arg(long)]
    workers: Option<usize>,
    /// Disable the detection cache
    #[arg(long)]
    no_cache: bool,
    /// Detection cache file
    #[arg(long, conflicts_with = "no_cache")]
    cache_path: Option<PathBuf>,
    /// Crop anchor when no face is found: center or upper
    #[arg(long)]
    no_face_anchor: Option<NoFaceAnchor>,
    /// Write the run summary as JSON
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Size {
    width: u32,
    height: u32,
}

fn parse_size(value: &str) -> Result<Size, String> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{value}' (expected WIDTHxHEIGHT)"))?;
    let parse = |s: &str| s.trim().parse::<u32>().ok().filter(|n| *n > 0);
    match (parse(w), parse(h)) {
        (Some(width), Some(height)) => Ok(Size { width, height }),
        _ => Err(format!("invalid size '{value}' (width and height must be positive)")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let result = match cli.command {
        Commands::Generate(args) => generate(&config, args).await,
        Commands::ValidateProfile { profile } => validate_profile(&profile),
        Commands::Detect { photo, detector } => detect(&config, &photo, detector).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn generate(config: &Config, args: GenerateArgs) -> Result<ExitCode> {
    let request = match (&args.profile, args.size) {
        (Some(path), _) => SizeRequest::Profile {
            profile: SizeProfile::load(path)?,
            mode: if args.all_variants {
                ProfileMode::AllVariants
            } else {
                ProfileMode::FirstVariant
            },
        },
        (None, Some(size)) => SizeRequest::Single {
            width: size.width,
            height: size.height,
            placeholder: args.placeholder.clone(),
        },
        (None, None) => bail!("either --size or --profile is required"),
    };
    let plans = resolve_variants(&request, &args.output)?;
    let roster = roster::load(&args.roster)?;

    let detector = init_detector(config, args.detector.as_deref()).await?;

    let cache: Option<Arc<dyn DetectionCache>> = if args.no_cache {
        None
    } else {
        let path = args.cache_path.clone().unwrap_or_else(|| config.cache_path.clone());
        Some(Arc::new(FileCache::open(path)))
    };

    let options = GenerateOptions {
        format: args.format,
        jpeg_quality: args.jpeg_quality.unwrap_or(config.jpeg_quality),
        workers: args.workers.unwrap_or(config.workers).max(1),
        no_face_anchor: args.no_face_anchor,
        ..Default::default()
    };

    let generator = PortraitGenerator::new(detector, cache, options);
    let cancel = generator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight portraits");
            cancel.cancel();
        }
    });

    let (summary, lost) = match generator.run(&roster, &plans).await {
        Ok(summary) => (summary, None),
        Err(GenerateError::BackendLost {
            backend,
            reason,
            summary,
        }) => (*summary, Some(format!("detector '{backend}' became unavailable: {reason}"))),
        Err(e) => return Err(e.into()),
    };

    if let Some(path) = &args.summary {
        summary
            .write_json(path)
            .with_context(|| format!("failed to write summary {}", path.display()))?;
    }
    print_summary(&summary);

    if let Some(message) = lost {
        bail!(message);
    }
    Ok(if summary.has_failures() || summary.cancelled {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn init_detector(config: &Config, chain: Option<&str>) -> Result<Arc<dyn FaceDetector>> {
    let chain = chain.unwrap_or(&config.detector);
    let kinds = detector::parse_chain(chain)?;
    let detector = detector::initialize_chain(&kinds, &config.detector_settings())
        .await
        .context("no face detector could be initialized")?;
    Ok(detector)
}

fn print_summary(summary: &RunSummary) {
    let c = &summary.counts;
    println!(
        "{} generated, {} placeholder, {} failed, {} skipped ({} ms, detector {})",
        c.generated, c.placeholder, c.failed, c.skipped, summary.elapsed_ms, summary.detector_id
    );
    if summary.cancelled || summary.not_dispatched > 0 {
        println!("{} identities not processed", summary.not_dispatched);
    }
    for outcome in summary.outcomes.iter().filter(|o| o.error_detail.is_some()) {
        println!(
            "  {} [{}]: {}",
            outcome.identity_id,
            outcome.variant_key,
            outcome.error_detail.as_deref().unwrap_or_default()
        );
    }
}

fn validate_profile(path: &Path) -> Result<ExitCode> {
    let profile = SizeProfile::load(path)?;
    let default_key = profile.default_variant().map(|v| v.key.as_str());

    println!("profile '{}': {} variant(s)", profile.name, profile.variants.len());
    for variant in &profile.variants {
        let marker = if Some(variant.key.as_str()) == default_key { "*" } else { " " };
        print!(
            "{marker} {:<12} {}x{}  -> {}/",
            variant.key,
            variant.width,
            variant.height,
            variant.subfolder()
        );
        match &variant.placeholder_path {
            Some(p) => println!("  placeholder {}", p.display()),
            None => println!(),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn detect(config: &Config, photo: &Path, chain: Option<String>) -> Result<ExitCode> {
    let image = image::open(photo).with_context(|| format!("failed to open photo {}", photo.display()))?;
    let detector = init_detector(config, chain.as_deref()).await?;
    let landmarks = detector
        .detect(Arc::new(image.to_rgb8()), &CancelHandle::new())
        .await
        .with_context(|| format!("detection failed for {}", photo.display()))?;
    println!("{}", serde_json::to_string_pretty(&landmarks)?);
    Ok(ExitCode::SUCCESS)
}
