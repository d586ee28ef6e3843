//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::engine::{default_workers, EngineConfig};
use crate::index::IndexCommand;
use crate::transport::Transport;

/// tags-lsp - language server tracking workspace folders and open documents, rebuilding a tags index per folder
#[derive(Parser, Debug)]
#[command(name = "tags-lsp")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Communicate over standard input/output (default)
    #[arg(long, conflicts_with_all = ["pipe", "port"])]
    pub stdio: bool,

    /// Connect to a Unix domain socket or named pipe
    #[arg(long, value_name = "PATH", conflicts_with = "port")]
    pub pipe: Option<PathBuf>,

    /// Connect to a TCP port on 127.0.0.1
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Append logs to this file instead of standard error
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Worker threads running request handlers
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: Option<u16>,

    /// Command run in each workspace folder to build the tags index (e.g. "gtags -i")
    #[arg(long, value_name = "CMD")]
    pub index_command: Option<String>,

    /// Connection attempts for --pipe and --port
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub connect_retries: u32,
}

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub transport: Transport,
    pub log_file: Option<PathBuf>,
    pub engine: EngineConfig,
    pub index_command: Option<IndexCommand>,
    pub connect_retries: u32,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        let transport = match (cli.pipe, cli.port) {
            (Some(path), _) => Transport::Pipe(path),
            (None, Some(port)) => Transport::Port(port),
            (None, None) => Transport::Stdio,
        };

        Self {
            transport,
            log_file: cli.log_file,
            engine: EngineConfig {
                workers: cli.workers.map_or_else(default_workers, usize::from),
            },
            index_command: cli.index_command.as_deref().and_then(IndexCommand::parse),
            connect_retries: cli.connect_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<ServerConfig, clap::Error> {
        Cli::try_parse_from(std::iter::once("tags-lsp").chain(args.iter().copied())).map(ServerConfig::from)
    }

    #[test]
    fn test_about_describes_served_features() {
        use clap::CommandFactory;

        let about = Cli::command().get_about().map(|a| a.to_string()).unwrap_or_default();
        assert!(about.contains("tags index"));
        assert!(!about.contains("navigation"));
    }

    #[test]
    fn test_defaults_to_stdio() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.transport, Transport::Stdio);
        assert_eq!(config.connect_retries, 1);
        assert_eq!(config.index_command, None);
        assert!(config.engine.workers >= 2);

        assert_eq!(parse(&["--stdio"]).unwrap().transport, Transport::Stdio);
    }

    #[test]
    fn test_transport_selection() {
        assert_eq!(
            parse(&["--pipe", "/tmp/lsp.sock"]).unwrap().transport,
            Transport::Pipe(PathBuf::from("/tmp/lsp.sock"))
        );
        assert_eq!(
            parse(&["--port", "2087"]).unwrap().transport,
            Transport::Port(2087)
        );
    }

    #[test]
    fn test_transports_are_exclusive() {
        assert!(parse(&["--stdio", "--port", "1"]).is_err());
        assert!(parse(&["--pipe", "/p", "--port", "1"]).is_err());
        assert!(parse(&["--stdio", "--pipe", "/p"]).is_err());
    }

    #[test]
    fn test_workers_and_index_command() {
        let config = parse(&["--workers", "3", "--index-command", "gtags -i", "--connect-retries", "4"]).unwrap();
        assert_eq!(config.engine.workers, 3);
        assert_eq!(
            config.index_command,
            Some(IndexCommand::new("gtags", vec!["-i".to_string()]))
        );
        assert_eq!(config.connect_retries, 4);

        assert!(parse(&["--workers", "0"]).is_err());
    }

    #[test]
    fn test_log_file() {
        let config = parse(&["--log-file", "/tmp/tags-lsp.log"]).unwrap();
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/tags-lsp.log")));
    }
}
