use crate::config::RegistryConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Registry listening host
    #[arg(long, env = "OCI_REGISTRY_HOST", default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Registry listening port
    #[arg(short, long, env = "OCI_REGISTRY_PORT", default_value_t = 8968, global = true)]
    pub port: u16,

    /// Registry root path
    #[arg(
        long,
        env = "OCI_REGISTRY_ROOTDIR",
        default_value = "/var/lib/oci-registry",
        global = true
    )]
    pub root: PathBuf,

    /// Registry url
    #[arg(
        long,
        env = "OCI_REGISTRY_PUBLIC_URL",
        default_value = "http://127.0.0.1:8968",
        global = true
    )]
    pub url: String,

    /// SQLite database file
    #[arg(
        long,
        env = "OCI_REGISTRY_DATABASE",
        default_value = "/var/lib/oci-registry/registry.db",
        global = true
    )]
    pub database: PathBuf,

    /// htpasswd file; anonymous access when unset
    #[arg(long, env = "OCI_REGISTRY_HTPASSWD", global = true)]
    pub htpasswd: Option<PathBuf>,

    /// Basic auth realm
    #[arg(long, env = "OCI_REGISTRY_REALM", default_value = "Registry", global = true)]
    pub realm: String,

    /// Seconds an upload session may stay idle before it is aborted
    #[arg(long, env = "OCI_REGISTRY_UPLOAD_TIMEOUT", default_value_t = 3600, global = true)]
    pub upload_timeout: u64,

    /// Seconds between upload session sweeps
    #[arg(long, env = "OCI_REGISTRY_SWEEP_INTERVAL", default_value_t = 60, global = true)]
    pub sweep_interval: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "OCI_REGISTRY_REQUEST_TIMEOUT", default_value_t = 120, global = true)]
    pub request_timeout: u64,

    /// Upper bound on tags returned per page
    #[arg(long, env = "OCI_REGISTRY_MAX_TAG_PAGE", default_value_t = 1000, global = true)]
    pub max_tag_page: usize,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the registry (default)
    Serve,
    /// Apply database migrations and exit
    InitDb,
    /// Print the resolved configuration as JSON
    ShowConfig,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }

    pub fn to_config(&self) -> RegistryConfig {
        RegistryConfig {
            host: self.host.clone(),
            port: self.port,
            registry_url: self.url.clone(),
            root_dir: self.root.clone(),
            database_file: self.database.clone(),
            htpasswd_file: self.htpasswd.clone(),
            realm: self.realm.clone(),
            upload_idle_timeout_secs: self.upload_timeout,
            sweep_interval_secs: self.sweep_interval,
            request_timeout_secs: self.request_timeout,
            max_tag_page: self.max_tag_page,
        }
    }
}
