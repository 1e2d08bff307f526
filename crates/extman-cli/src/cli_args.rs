use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

fn parse_timeout_ms(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "extension-manager",
    about = "REST service that installs and manages database extensions",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "EXTMAN_CONFIG",
        help = "Optional TOML config file; command-line flags override its values"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "EXTMAN_BIND",
        help = "Socket address the REST server listens on (default 127.0.0.1:8080)"
    )]
    pub bind: Option<SocketAddr>,

    #[arg(
        long = "extensions-dir",
        env = "EXTMAN_EXTENSIONS_DIR",
        help = "Directory scanned for extension manifests on every request"
    )]
    pub extensions_dir: Option<PathBuf>,

    #[arg(
        long = "bucketfs-base-path",
        env = "EXTMAN_BUCKETFS_BASE_PATH",
        help = "BucketFS path listed when extensions look up their artifacts"
    )]
    pub bucketfs_base_path: Option<String>,

    #[arg(
        long = "database-dir",
        env = "EXTMAN_DATABASE_DIR",
        help = "Directory holding one SQLite database per dbHost/dbPort pair"
    )]
    pub database_dir: Option<PathBuf>,

    #[arg(
        long = "request-timeout-ms",
        env = "EXTMAN_REQUEST_TIMEOUT_MS",
        value_parser = parse_timeout_ms,
        help = "Deadline for a single operation in milliseconds; 0 disables it"
    )]
    pub request_timeout_ms: Option<u64>,
}
