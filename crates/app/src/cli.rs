use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use vision::{PipelineSettings, PipelineType};

use crate::{config::RunConfig, runtime};

/// Camera vision pipelines with runtime switching.
#[derive(Parser, Debug)]
#[command(name = "sightline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the vision pipeline against an image or camera
    Run(crate::config::RunArgs),

    /// List pipeline kinds with their base indices and threshold planes
    Kinds,

    /// Print default settings for a pipeline kind as JSON
    Defaults(DefaultsArgs),
}

#[derive(Args, Debug)]
pub struct DefaultsArgs {
    /// Pipeline kind label or base index
    pub kind: String,

    /// Nickname written into the settings
    #[arg(long, default_value = "New Pipeline")]
    pub nickname: String,
}

pub fn handle(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = RunConfig::try_from(args)?;
            runtime::run(config)
        }
        Command::Kinds => {
            for kind in PipelineType::ALL {
                println!(
                    "{:>3}  {:<14} {:?}",
                    kind.base_index(),
                    kind.label(),
                    kind.threshold_type()
                );
            }
            Ok(())
        }
        Command::Defaults(args) => {
            let kind = PipelineType::parse(&args.kind)
                .ok_or_else(|| anyhow!("unknown pipeline kind {:?}", args.kind))?;
            let settings = PipelineSettings::new(kind, args.nickname);
            let json = serde_json::to_string_pretty(&settings)
                .context("failed to serialise pipeline settings")?;
            println!("{json}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_parses_into_run_args() {
        let cli = Cli::try_parse_from(["sightline", "run", "--image", "frame.png"]).unwrap();
        assert!(matches!(cli.command, Command::Run(_)));
    }

    #[test]
    fn defaults_takes_a_kind() {
        let cli = Cli::try_parse_from(["sightline", "defaults", "apriltag"]).unwrap();
        match cli.command {
            Command::Defaults(args) => {
                assert_eq!(args.kind, "apriltag");
                assert_eq!(args.nickname, "New Pipeline");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["sightline"]).is_err());
    }
}
