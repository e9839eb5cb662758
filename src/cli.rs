// Command-line interface for the loglens servers

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "loglens", version, about = "Log ingestion and natural-language analysis")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the log collector (ingest endpoint + store statistics)
    Collector,
    /// Run the analysis server (Text-to-SQL, streaming, alerts)
    Analysis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from(["loglens", "collector"]);
        assert!(matches!(cli.command, Command::Collector));

        let cli = Cli::parse_from(["loglens", "analysis"]);
        assert!(matches!(cli.command, Command::Analysis));
    }
}
