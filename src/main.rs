use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use vidface::{config, server, MatchSettings, Pipeline, ReferenceSet, Verdict, Verifier};
use vidface::sampler::{FramePicker, RandomPicker};
use vidface_vision::{Ffmpeg, SharedExtractor};

#[derive(Parser)]
#[command(name = "vidface")]
#[command(
    version,
    about = "Check whether a known person appears in a video"
)]
struct Cli {
    /// Config file (defaults to the compiled-in location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the reference images and save the face index
    BuildIndex,
    /// Verify a local video file against the reference faces
    Verify {
        video: PathBuf,
        /// Seed the frame sampler for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Serve the verification endpoint
    Serve {
        /// Address to listen on (overrides `bind` from the config)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::BuildIndex => build_index(&cfg),
        Commands::Verify { video, seed } => verify(&cfg, &video, seed),
        Commands::Serve { bind } => serve(&cfg, bind),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn load_pipeline(cfg: &config::Config) -> Result<Pipeline> {
    Pipeline::new(&cfg.models).context("Failed to initialize face recognition pipeline")
}

fn build_index(cfg: &config::Config) -> Result<()> {
    let mut pipeline = load_pipeline(cfg)?;
    let set = ReferenceSet::build(cfg, &mut pipeline)?;
    set.persist(cfg)?;

    info!(
        "✓ Indexed {} reference face(s) into {}",
        set.database().len(),
        cfg.index_path.display()
    );
    Ok(())
}

fn verify(cfg: &config::Config, video: &Path, seed: Option<u64>) -> Result<()> {
    let mut pipeline = load_pipeline(cfg)?;
    let references = ReferenceSet::prepare(cfg, &mut pipeline)?;
    let decoder = Ffmpeg::new(&cfg.ffmpeg, &cfg.ffprobe);

    let mut picker: Box<dyn FramePicker> = match seed {
        Some(seed) => Box::new(RandomPicker::seeded(seed)),
        None => Box::new(RandomPicker::from_entropy()),
    };

    let result = Verifier::new(&references, MatchSettings::from(cfg)).verify_path(
        video,
        &decoder,
        &mut pipeline,
        picker.as_mut(),
    );
    let outcome = result.with_context(|| format!("verifying {}", video.display()))?;
    let verdict = Verdict::from(outcome);

    if verdict.is_match() {
        info!("✓ {}", verdict.message());
        Ok(())
    } else {
        anyhow::bail!("{}", verdict.message())
    }
}

fn serve(cfg: &config::Config, bind: Option<String>) -> Result<()> {
    let mut pipeline = load_pipeline(cfg)?;
    let references = ReferenceSet::prepare(cfg, &mut pipeline)?;
    let state = server::AppState::new(
        cfg,
        Arc::new(references),
        SharedExtractor::new(pipeline),
        Arc::new(Ffmpeg::new(&cfg.ffmpeg, &cfg.ffprobe)),
    )?;
    let bind = bind.unwrap_or_else(|| cfg.bind.clone());

    tokio::runtime::Runtime::new()
        .context("starting async runtime")?
        .block_on(server::serve(state, &bind, cfg.max_upload_bytes))
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
