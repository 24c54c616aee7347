use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Parley chat server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "parley-server", version, about = "Parley chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PARLEY_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PARLEY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./parley.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PARLEY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "PARLEY_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Origins allowed to reach the HTTP API and the WebSocket endpoint
    #[arg(
        long,
        env = "PARLEY_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:4200"
    )]
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./parley.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            allowed_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PARLEY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PARLEY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Parley Chat Server Configuration
# Place this file at ./parley.toml or specify with --config <path>
# All settings can be overridden via environment variables (PARLEY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# Origins allowed to reach the HTTP API and WebSocket endpoint
# allowed_origins = ["http://localhost:4200"]
"#
    .to_string()
}
