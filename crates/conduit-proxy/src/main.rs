use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use conduit_proxy::config::Config;
use conduit_proxy::metrics::serve_metrics;
use conduit_proxy::rules::{create_rule_store, validate_rules, FileRuleStore, ForwardRule, RuleStore};
use conduit_proxy::scripting::ScriptLanguage;
use conduit_proxy::ConduitServer;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

#[derive(Parser, Debug)]
#[command(name = "conduit", author, version, about = "Rule-driven HTTP forwarding engine")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "CONDUIT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override listen.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate rules and their scripts, then exit
    Check {
        /// Rules file (YAML or JSON); defaults to the configured store
        rules: Option<PathBuf>,
    },
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(&args.log_level, args.log_json);

    let mut config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        config.listen.port = port;
    }

    let result = match args.command {
        Some(Command::Check { rules }) => check(&config, rules).await,
        None => serve(config).await.map(|()| ExitCode::SUCCESS),
    };

    result.unwrap_or_else(|e| {
        error!("{e:#}");
        ExitCode::FAILURE
    })
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = create_rule_store(&config.store)?;
    let language = default_language(&config)?;

    // Problems are reported, not fatal; the resolver skips rules it cannot route.
    match store.list_all().await {
        Ok(rules) => {
            for issue in validate_rules(&rules, language) {
                warn!("{issue}");
            }
            info!("Loaded {} forward rules", rules.len());
        }
        Err(e) => warn!("Rule store not readable at startup: {e}"),
    }

    if let Some(metrics) = &config.metrics {
        let addr = metrics.socket_addr()?;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr).await {
                error!("Metrics server failed: {e}");
            }
        });
    }

    let server = ConduitServer::new(&config, store)?;
    let listener = server.bind().await?;
    server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn check(config: &Config, rules_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let store: Arc<dyn RuleStore> = match &rules_path {
        Some(path) => Arc::new(FileRuleStore::open(path)?),
        None => create_rule_store(&config.store)?,
    };
    let rules: Vec<ForwardRule> = store.list_all().await?;
    let issues = validate_rules(&rules, default_language(config)?);

    for issue in &issues {
        let color = if issue.is_error() { RED } else { YELLOW };
        println!("{color}{issue}{RESET}");
    }

    let errors = issues.iter().filter(|i| i.is_error()).count();
    let warnings = issues.len() - errors;
    if errors > 0 {
        println!("{RED}{} rules checked: {errors} errors, {warnings} warnings{RESET}", rules.len());
        Ok(ExitCode::FAILURE)
    } else {
        println!("{GREEN}{} rules checked: 0 errors, {warnings} warnings{RESET}", rules.len());
        Ok(ExitCode::SUCCESS)
    }
}

fn default_language(config: &Config) -> anyhow::Result<ScriptLanguage> {
    ScriptLanguage::from_name(&config.scripting.engine)
        .ok_or_else(|| anyhow::anyhow!("Unknown script engine type: '{}'", config.scripting.engine))
}
