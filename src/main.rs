use anyhow::{Context, Result};
use clap::Parser;
use speechflow::app::{SimulationOptions, run_simulation};
use speechflow::cli::{Cli, Commands};
use speechflow::config::Config;
use speechflow::pipeline::{CommandPacket, Script};
use std::path::Path;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "error".to_string(),
        (false, 0) => config.log.level.clone(),
        (false, 1) => "debug".to_string(),
        (false, _) => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    log::debug!("speechflow {}", speechflow::version_string());

    match cli.command {
        Commands::Simulate {
            script,
            mode,
            nbest,
            group,
            json,
            timeout,
        } => {
            if let Some(mode) = mode {
                config.recognizer.mode = mode;
            }
            if let Some(nbest) = nbest {
                config.recognizer.nbest = nbest;
            }
            if group.is_some() {
                config.recognizer.group = group;
            }
            simulate(&config, &script, json, timeout)?;
        }
        Commands::Parse { command, json } => {
            let parsed = CommandPacket::parse(&command)
                .with_context(|| format!("Failed to parse command '{}'", command))?;
            if json {
                println!("{}", serde_json::to_string(&parsed)?);
            } else {
                println!("{}", parsed);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn simulate(config: &Config, path: &Path, json: bool, timeout: Duration) -> Result<()> {
    let script = Script::load(path)
        .with_context(|| format!("Failed to load script {}", path.display()))?;
    log::info!("simulate: {} packets from {}", script.len(), path.display());

    let options = SimulationOptions {
        timeout,
        ..SimulationOptions::default()
    };
    let report = run_simulation(config, script, &options)?;

    for packet in &report.output {
        if json {
            println!("{}", serde_json::to_string(packet)?);
        } else {
            println!("{}", packet);
        }
    }

    if !report.is_success() {
        for message in &report.diagnostics {
            eprintln!("{}", message);
        }
        eprintln!(
            "Error: source exited with {}, recognizer exited with {}",
            report.source_status, report.recognizer_status
        );
        let status = if report.recognizer_status != 0 {
            report.recognizer_status
        } else {
            report.source_status
        };
        std::process::exit(status);
    }
    if !report.terminated {
        log::warn!("simulate: recognizer did not terminate before the deadline");
    }

    Ok(())
}

/// Load config from the given path, the default location, or built-in defaults.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else if let Some(default_path) = Config::default_path() {
        Config::load_or_default(&default_path)?
    } else {
        Config::default()
    };

    Ok(config.with_env_overrides())
}
