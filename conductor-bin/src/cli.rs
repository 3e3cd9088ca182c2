use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use conductor_config::ConfigLoader;
use conductor_config::schema::{ConductorConfig, LoggingConfig};
use conductor_cost::{AuditLog, Authorizer, CostTracker, Role, SqliteCostStore};
use conductor_llm::anthropic::AnthropicProvider;
use conductor_llm::breaker::{CircuitBreaker, CircuitBreakerConfig};
use conductor_llm::failover::{FailoverObserver, FailoverProvider};
use conductor_llm::provider::Provider;
use conductor_llm::registry::{Credentials, ProviderRegistry};
use conductor_llm::retry::{RetryPolicy, RetryProvider};
use conductor_server::auth::{AuthConfig, TokenAuthenticator, generate_token};
use conductor_server::costapi::CostApiState;
use conductor_server::llm::{LlmState, register_methods};
use conductor_server::metrics::Metrics;
use conductor_server::registry::HandlerRegistry;
use conductor_server::{RpcServer, ServerDeps};

#[derive(Parser)]
#[command(name = "conductor", version, about = "LLM traffic controller daemon")]
pub struct Cli {
    /// Path to conductor.toml (default: ~/.conductor/conductor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the backend daemon.
    Start,
    /// Generate a client token suitable for `server.auth_token`.
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum TokenCommand {
    Generate,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Validate,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Start => start_daemon(self.config.as_deref()).await,
            Command::Token {
                command: TokenCommand::Generate,
            } => {
                println!("{}", generate_token());
                Ok(())
            }
            Command::Config {
                command: ConfigCommand::Validate,
            } => {
                let loader = ConfigLoader::load(self.config.as_deref())?;
                let config = loader.get();
                match config.validate() {
                    Ok(warnings) => {
                        for w in warnings {
                            eprintln!("warning: {w}");
                        }
                        eprintln!("{} is valid", loader.path().display());
                        Ok(())
                    }
                    Err(e) => anyhow::bail!("invalid configuration: {e}"),
                }
            }
        }
    }
}

fn init_tracing(config: &LoggingConfig) {
    // Logs go to stderr; stdout carries only the supervisor discovery line.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Logs provider failovers as they happen.
struct LogFailoverObserver;

impl FailoverObserver for LogFailoverObserver {
    fn on_failover(&self, from: &str, to: &str, cause: &conductor_core::ConductorError) {
        warn!(from, to, cause = %cause, "provider failover");
    }
}

fn retry_policy(config: &ConductorConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.retry.max_retries,
        initial_delay: Duration::from_millis(config.retry.initial_delay_ms),
        max_delay: Duration::from_millis(config.retry.max_delay_ms),
        multiplier: config.retry.multiplier,
        jitter: config.retry.jitter,
        absolute_timeout: config.retry.absolute_timeout_secs.map(Duration::from_secs),
    }
}

/// Build the provider registry from credential sections, each provider
/// wrapped with the configured retry policy.
fn build_registry(config: &ConductorConfig) -> anyhow::Result<Arc<ProviderRegistry>> {
    let registry = Arc::new(ProviderRegistry::new());
    let policy = retry_policy(config);

    registry
        .register_factory(
            "anthropic",
            Box::new(move |creds: &Credentials| {
                let api_key = creds.api_key.clone().ok_or_else(|| {
                    conductor_core::ConductorError::Config(
                        "anthropic provider requires an api_key".into(),
                    )
                })?;
                let mut provider = AnthropicProvider::new(api_key);
                if let Some(ref base_url) = creds.base_url {
                    provider = provider.with_base_url(base_url.clone());
                }
                Ok(Arc::new(RetryProvider::new(Arc::new(provider), policy)) as Arc<dyn Provider>)
            }),
        )
        .map_err(|e| anyhow::anyhow!(e))?;

    for (name, creds) in &config.providers {
        let credentials = Credentials {
            api_key: creds.api_key.clone(),
            base_url: creds.base_url.clone(),
        };
        match registry.activate(name, &credentials) {
            Ok(_) => info!(provider = %name, "provider activated"),
            Err(e) => warn!(provider = %name, error = %e, "provider not activated"),
        }
    }
    Ok(registry)
}

fn cost_db_path(config: &ConductorConfig) -> PathBuf {
    config.cost.db_path.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conductor")
            .join("costs.db")
    })
}

async fn start_daemon(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let loader = ConfigLoader::load(config_path)?;
    let config = loader.get();
    init_tracing(&config.logging);
    info!(config = %loader.path().display(), "starting conductor backend");

    let registry = build_registry(&config)?;
    let names = registry.names();
    if names.is_empty() {
        warn!("no providers activated; llm methods will fail until one is registered");
    } else if registry.default_name().is_none() {
        registry
            .set_default(&names[0])
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let order = if config.failover.order.is_empty() {
        names.clone()
    } else {
        config.failover.order.clone()
    };
    registry
        .set_failover_order(order.clone())
        .map_err(|e| anyhow::anyhow!(e))?;

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        threshold: config.failover.circuit_breaker_threshold,
        recovery_timeout: Duration::from_secs(config.failover.circuit_breaker_timeout_secs),
    }));
    let chain: Arc<dyn Provider> = Arc::new(
        FailoverProvider::new(Arc::clone(&registry), order)
            .with_breaker(Arc::clone(&breaker))
            .with_observer(Arc::new(LogFailoverObserver)),
    );

    let db_path = cost_db_path(&config);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteCostStore::open(&db_path)?);
    let tracker = Arc::new(CostTracker::with_store(store.clone()));

    // Daily retention sweep.
    {
        use conductor_cost::CostStore;
        let store = store.clone();
        let retention = Duration::from_secs(config.cost.retention_days as u64 * 24 * 3600);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                interval.tick().await;
                match store.delete_older_than(retention).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "expired cost records deleted"),
                    Err(e) => warn!(error = %e, "cost retention sweep failed"),
                }
            }
        });
    }

    let authz = Arc::new(Authorizer::new());
    for user in &config.cost.admin_users {
        authz.assign_role(user, Role::CostAdmin);
    }
    for user in &config.cost.viewer_users {
        authz.assign_role(user, Role::CostViewer);
    }

    let metrics = Metrics::new();
    let handlers = Arc::new(HandlerRegistry::new());
    register_methods(
        &handlers,
        Arc::new(LlmState {
            chain,
            registry,
            breaker,
            tracker,
            metrics: metrics.clone(),
        }),
    );

    let authenticator = config
        .server
        .auth_token
        .as_ref()
        .filter(|t| !t.is_empty())
        .map(|t| Arc::new(TokenAuthenticator::new(t.clone(), AuthConfig::default())));

    let server = RpcServer::start(
        &config.server,
        ServerDeps {
            handlers,
            authenticator,
            cost_api: Arc::new(CostApiState {
                store,
                authz,
                audit: Arc::new(AuditLog::new()),
            }),
            metrics,
        },
    )
    .await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("signal received, shutting down");
    server.shutdown().await?;
    Ok(())
}
