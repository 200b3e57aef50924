use anyhow::Context;
use clap::{Parser, Subcommand};
use contract_proxy::config::{create_default_config_file, AppConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "contract-proxy")]
#[command(about = "Operator tooling for the contract negotiation engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file
    InitConfig { path: PathBuf },

    /// Validate a configuration file and its templates
    CheckConfig {
        #[arg(short, long, default_value = "contract-proxy.toml")]
        config: PathBuf,
    },

    /// List configured templates with their parameters and hashes
    Templates {
        #[arg(short, long, default_value = "contract-proxy.toml")]
        config: PathBuf,
    },
}

fn load(path: &PathBuf) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_with_env_overrides(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.logging.init();
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::InitConfig { path } => {
            create_default_config_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Command::CheckConfig { config } => {
            let app_config = load(&config)?;
            let settings = app_config.settings()?;
            let templates = app_config.load_templates(&settings)?;
            tracing::info!(templates = templates.len(), "Configuration is valid");

            let algorithms: Vec<String> = settings
                .accepted_hash_algorithms
                .iter()
                .map(|alg| alg.to_string())
                .collect();
            println!("Configuration OK");
            println!("  accepted hash algorithms: {}", algorithms.join(", "));
            println!("  preferred: {}", settings.preferred_hash_algorithm());
            println!(
                "  timestamp tolerance: {}s",
                settings.timestamp_tolerance.num_seconds()
            );
            println!("  templates: {}", templates.len());
        }
        Command::Templates { config } => {
            let app_config = load(&config)?;
            let settings = app_config.settings()?;
            let templates = app_config.load_templates(&settings)?;

            let mut sorted: Vec<_> = templates.iter().collect();
            sorted.sort_by(|a, b| a.name().cmp(b.name()));
            for template in sorted {
                println!("{}", template.name());
                let parameters: Vec<&str> =
                    template.parameters().iter().map(String::as_str).collect();
                println!("  parameters: {}", parameters.join(", "));
                for hash in template.hashes() {
                    println!("  {}", hash);
                }
            }
        }
    }

    Ok(())
}
