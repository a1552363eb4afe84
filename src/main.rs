use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use clap::Parser;

use holo_locate::config::{self, AppConfig};
use holo_locate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use holo_locate::{LocatorError, LocatorResult, Locator, ParseRequest};

#[derive(Parser)]
#[command(name = "holo-locate")]
#[command(about = "Locate UI elements on a screenshot with a vision-language model")]
struct Args {
    #[arg(short, long, help = "Screenshot to analyze (PNG, JPEG, ...)")]
    image: PathBuf,

    #[arg(short, long, help = "Locate a single element described by this instruction")]
    task: Option<String>,

    #[arg(short, long, help = "Performance profile: speed, balanced or quality")]
    profile: Option<String>,

    #[arg(long, help = "Maximum detections to return (1-200)")]
    max_detections: Option<usize>,

    #[arg(long, help = "Confidence floor when adaptive thresholds are off")]
    min_confidence: Option<f64>,

    #[arg(long, help = "Include raw model outputs in the result")]
    raw: bool,

    #[arg(long, value_name = "PATH", help = "Write the set-of-mark annotated PNG here")]
    som: Option<PathBuf>,

    #[arg(short, long, value_name = "PATH", help = "Config file (default: config.toml next to the binary or in the working directory)")]
    config: Option<PathBuf>,
}

fn load_app_config(path: Option<&PathBuf>) -> LocatorResult<AppConfig> {
    let mut cfg = match path {
        Some(p) => config::load_config_from(p)?,
        None => config::load_config().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "using built-in defaults");
            AppConfig::default()
        }),
    };
    cfg.apply_env();
    Ok(cfg)
}

async fn run(args: Args) -> LocatorResult<()> {
    let cfg = load_app_config(args.config.as_ref())?;

    let image = image::open(&args.image)?;
    tracing::info!(
        path = %args.image.display(),
        width = image.width(),
        height = image.height(),
        "screenshot loaded"
    );

    let provider = OpenAiCompatibleProvider::from_config(&cfg.model, &cfg.prompts.system_prompt)?;
    let locator = Locator::new(Arc::new(provider), cfg);

    let request = ParseRequest {
        task: args.task,
        include_som: args.som.is_some(),
        max_detections: args.max_detections,
        min_confidence: args.min_confidence,
        return_raw_outputs: args.raw.then_some(true),
        performance_profile: args.profile,
        ..ParseRequest::default()
    };

    let outcome = locator.parse_screenshot(&image, &request).await;

    if let (Some(path), Some(encoded)) = (&args.som, &outcome.som_image) {
        let png = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| LocatorError::Image(format!("set-of-mark decode: {e}")))?;
        std::fs::write(path, png)?;
        tracing::info!(path = %path.display(), "set-of-mark image written");
    }

    // The annotated image goes to its own file, not into the printed JSON.
    let mut printable = outcome;
    printable.som_image = None;
    println!("{}", serde_json::to_string_pretty(&printable)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    holo_locate::init_tracing();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "holo-locate failed");
        std::process::exit(1);
    }
}
