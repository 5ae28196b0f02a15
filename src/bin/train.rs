/// Depth completion training entry point
///
/// Resumes from `<stats_dir>/<stats_exper>/checkpoint.tar` when present.
use std::path::PathBuf;

use cbam_depth::{Config, ConfigBuilder, RunContext, Trainer};
use clap::Parser;

#[derive(Parser)]
#[command(name = "train", about = "Train a CBAM depth completion model")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long = "cfg", short = 'c', default_value = "configs/default.yaml")]
    cfg: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.cfg)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("Configuration loaded from {}", cli.cfg.display());
    let context = RunContext::new(config)?;

    let builder = ConfigBuilder::new(context.config.clone());
    let mut trainer = Trainer::from_builder(&builder, context.device.clone())?;
    let summary = trainer.train()?;

    log::info!(
        "Ran {} epochs; best testing loss {:.6}",
        summary.epochs_run,
        summary.min_loss
    );
    Ok(())
}
