mod api;

use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vantage_core::contracts::ContentRule;
use vantage_ingest::RuleMatcher;
use vantage_storage::TrackingStore;

const DEFAULT_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_DB_PATH: &str = "vantage.db";
const LOG_FILE_NAME: &str = "vantage-hub.log";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: PathBuf,
    debug: bool,
    log_dir: String,
    seed_rules: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(name = "vantage-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// JSON array of content rules upserted into the store at startup.
    #[arg(long)]
    seed_rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match TrackingStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_failed", path = %config.db_path.display(), error = %err);
            return;
        }
    };
    if let Some(path) = &config.seed_rules {
        match seed_rules(&store, path) {
            Ok(count) => info!(event = "rules_seeded", count, path = %path.display()),
            Err(err) => {
                error!(event = "rules_seed_failed", path = %path.display(), error = %err);
                return;
            }
        }
    }

    let state = Arc::new(api::AppState::new(store, RuleMatcher::default()));
    let app = api::app(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        db = %config.db_path.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn seed_rules(store: &TrackingStore, path: &Path) -> Result<usize, String> {
    let raw = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    let rules: Vec<ContentRule> = serde_json::from_str(&raw).map_err(|err| err.to_string())?;
    for rule in &rules {
        if rule.selector.trim().is_empty() || rule.condition_value.is_empty() {
            warn!(event = "rule_skipped", rule_id = %rule.id);
            continue;
        }
        store.upsert_rule(rule).map_err(|err| err.to_string())?;
    }
    Ok(rules.len())
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_setting(&args.addr, "VANTAGE_HUB_ADDR", DEFAULT_ADDR),
        db_path: PathBuf::from(resolve_setting(&args.db, "VANTAGE_DB_PATH", DEFAULT_DB_PATH)),
        debug: args.debug || truthy(&resolve_setting("", "VANTAGE_HUB_DEBUG", "")),
        log_dir: resolve_setting(&args.log_dir, "VANTAGE_LOG_DIR", ""),
        seed_rules: args.seed_rules,
    }
}

/// Stdout always; a plain-text copy under the log directory when one is configured.
fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        resolve_setting("", "VANTAGE_LOG_LEVEL", "info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match open_log_file(&config.log_dir) {
        Ok(file) => file.map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        }),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();
}

fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
        .map(Some)
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Flag value, else the environment variable, else the default.
fn resolve_setting(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}
