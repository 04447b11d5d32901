//! # Queue Transport CLI
//!
//! Command-line administration of storage queues used by the transport.
//!
//! This module provides CLI commands for:
//! - Creating and purging queues
//! - Sending messages (optionally deferred) through the transport
//! - Receiving messages, acknowledging them or returning them to the queue
//! - Inspecting the resolved configuration
//!
//! Configuration is resolved from, in order: an optional configuration file
//! (TOML, YAML or JSON, chosen by extension), environment variables prefixed
//! `QT__` (e.g. `QT__TRANSPORT__PREFETCH_COUNT=8`), and command-line flags.

use clap::{Parser, Subcommand};
use queue_transport::{
    headers, CancellationToken, ConfigurationError, Headers, MessageEncoding, MessageId, QueueClientFactory,
    StaticTokenCredential, StorageQueueFactory, StorageQueueTransport, TransactionContext,
    Transport, TransportError, TransportMessage, TransportOptions, DEFERRED_MESSAGES_ADDRESS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Placeholder printed instead of secrets
const REDACTED: &str = "<redacted>";

// ============================================================================
// CLI Structure
// ============================================================================

/// qtctl - administer storage queues used by the queue transport
#[derive(Parser, Debug)]
#[command(name = "qtctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Administer storage queues used by the queue transport")]
pub struct Cli {
    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, env = "QT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage connection string
    #[arg(long, env = "QT_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: Option<String>,

    /// Queue service endpoint, used with --access-token
    #[arg(long, env = "QT_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Bearer token for the queue service endpoint
    #[arg(long, env = "QT_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Logging level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a queue if it does not exist
    Create {
        /// Queue name
        queue: String,
    },

    /// Delete every message in a queue
    Purge {
        /// Queue name
        queue: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Send a message to a queue
    Send {
        /// Destination queue name
        queue: String,

        /// Message body
        #[arg(short, long, default_value = "")]
        body: String,

        /// Message header as KEY=VALUE (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Deliver the message only after this many seconds
        #[arg(short, long)]
        defer_seconds: Option<u64>,

        /// Time to live, e.g. 00:10:00 or 1.00:00:00
        #[arg(short, long)]
        ttl: Option<String>,
    },

    /// Receive messages from a queue
    Receive {
        /// Queue name
        queue: String,

        /// Maximum number of messages to receive
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Delete received messages instead of returning them to the queue
        #[arg(short, long)]
        ack: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the resolved configuration, secrets redacted
    Show {
        /// Output format
        #[arg(short, long, default_value = "toml")]
        format: ConfigFormat,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// One JSON object per message
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigurationError> for CliError {
    fn from(err: ConfigurationError) -> Self {
        Self::Configuration(ConfigError::Invalid(err))
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// CLI configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// How to reach the queue service
    pub connection: ConnectionConfig,

    /// Transport options used by send, receive and purge
    pub transport: TransportOptions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Queue service connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Storage connection string; takes precedence over `endpoint`
    pub connection_string: Option<String>,

    /// Queue service endpoint for bearer-token authentication
    pub endpoint: Option<String>,

    /// Bearer token used with `endpoint`
    pub access_token: Option<String>,

    /// Representation of payloads in the service's message text
    pub message_encoding: MessageEncoding,

    /// Per-request timeout
    pub request_timeout_seconds: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            endpoint: None,
            access_token: None,
            message_encoding: MessageEncoding::default(),
            request_timeout_seconds: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl CliConfig {
    /// Apply command-line overrides on top of file and environment values
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(connection_string) = &cli.connection_string {
            self.connection.connection_string = Some(connection_string.clone());
        }
        if let Some(endpoint) = &cli.endpoint {
            self.connection.endpoint = Some(endpoint.clone());
        }
        if let Some(token) = &cli.access_token {
            self.connection.access_token = Some(token.clone());
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if cli.json_logs {
            self.logging.format = LogFormat::Json;
        }
    }

    /// Copy of the configuration that is safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.connection.connection_string.is_some() {
            config.connection.connection_string = Some(REDACTED.to_string());
        }
        if config.connection.access_token.is_some() {
            config.connection.access_token = Some(REDACTED.to_string());
        }
        config
    }
}

/// Load configuration from an optional file and `QT__` environment variables
pub fn load_configuration(path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let cli_config: CliConfig = builder
        .add_source(config::Environment::with_prefix("QT").separator("__"))
        .build()?
        .try_deserialize()?;

    cli_config.transport.validate()?;
    Ok(cli_config)
}

/// Build the queue client factory described by the connection settings
pub fn build_factory(
    connection: &ConnectionConfig,
) -> Result<Arc<dyn QueueClientFactory>, CliError> {
    let factory = if let Some(connection_string) = &connection.connection_string {
        StorageQueueFactory::from_connection_string(connection_string)?
    } else if let Some(endpoint) = &connection.endpoint {
        let token = connection
            .access_token
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "connection.access_token".to_string(),
            })?;
        StorageQueueFactory::with_token_credential(
            endpoint,
            Arc::new(StaticTokenCredential::new(token)),
        )?
    } else {
        return Err(ConfigError::MissingRequired {
            key: "connection.connection_string".to_string(),
        }
        .into());
    };

    let factory = factory
        .with_message_encoding(connection.message_encoding)?
        .with_request_timeout(std::time::Duration::from_secs(
            connection.request_timeout_seconds,
        ))?;

    debug!(endpoint = %factory.endpoint(), "Using storage queue endpoint");
    Ok(Arc::new(factory))
}

/// Parse a `KEY=VALUE` header argument
pub fn parse_header(arg: &str) -> Result<(String, String), CliError> {
    match arg.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(CliError::InvalidArgument {
            arg: "header".to_string(),
            message: format!("'{}' is not in KEY=VALUE form", arg),
        }),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    run(Cli::parse()).await
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = load_configuration(cli.config.as_deref())?;
    config.apply_overrides(&cli);

    initialize_logging(&config.logging)?;

    match cli.command {
        Commands::Create { queue } => execute_create_command(&queue, &config).await,
        Commands::Purge { queue, yes } => execute_purge_command(&queue, yes, &config).await,
        Commands::Send {
            queue,
            body,
            headers,
            defer_seconds,
            ttl,
        } => execute_send_command(&queue, body, &headers, defer_seconds, ttl, &config).await,
        Commands::Receive {
            queue,
            count,
            ack,
            format,
        } => execute_receive_command(&queue, count, ack, format, &config).await,
        Commands::Config { action } => match action {
            ConfigCommands::Show { format } => execute_config_show_command(format, &config),
        },
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Initialize logging; output goes to stderr so stdout stays machine-readable
fn initialize_logging(logging: &LoggingConfig) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "queue_transport={level},queue_transport_cli={level}",
            level = logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = match logging.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("could not initialize logging: {}", e),
    })
}

async fn execute_create_command(queue: &str, config: &CliConfig) -> Result<(), CliError> {
    info!(queue = %queue, "Creating queue");

    // An explicit create always creates, whatever the transport options say
    let options = TransportOptions {
        automatically_create_queues: true,
        ..config.transport.clone()
    };
    let transport = StorageQueueTransport::one_way(build_factory(&config.connection)?, options)?;
    transport.create_queue(queue).await?;

    println!("Queue '{}' is ready", queue);
    Ok(())
}

async fn execute_purge_command(queue: &str, yes: bool, config: &CliConfig) -> Result<(), CliError> {
    if !yes {
        return Err(CliError::InvalidArgument {
            arg: "yes".to_string(),
            message: format!("purging '{}' deletes every message; pass --yes to confirm", queue),
        });
    }

    info!(queue = %queue, "Purging queue");
    let transport = StorageQueueTransport::new(
        build_factory(&config.connection)?,
        queue,
        config.transport.clone(),
    )?;
    transport.purge_input_queue().await?;

    println!("Queue '{}' purged", queue);
    Ok(())
}

async fn execute_send_command(
    queue: &str,
    body: String,
    header_args: &[String],
    defer_seconds: Option<u64>,
    ttl: Option<String>,
    config: &CliConfig,
) -> Result<(), CliError> {
    let mut hdrs = Headers::new();
    for arg in header_args {
        let (key, value) = parse_header(arg)?;
        hdrs.insert(key, value);
    }

    let message_id = hdrs
        .entry(headers::MESSAGE_ID.to_string())
        .or_insert_with(|| MessageId::new().to_string())
        .clone();

    if let Some(ttl) = ttl {
        hdrs.insert(headers::TIME_TO_BE_RECEIVED.to_string(), ttl);
    }

    let destination = match defer_seconds {
        Some(seconds) => {
            let due = chrono::Utc::now() + chrono::Duration::seconds(seconds as i64);
            hdrs.insert(headers::DEFERRED_RECIPIENT.to_string(), queue.to_string());
            hdrs.insert(headers::DEFERRED_UNTIL.to_string(), due.to_rfc3339());
            DEFERRED_MESSAGES_ADDRESS
        }
        None => queue,
    };

    info!(
        queue = %queue,
        message_id = %message_id,
        defer_seconds = ?defer_seconds,
        "Sending message"
    );

    let transport = StorageQueueTransport::one_way(
        build_factory(&config.connection)?,
        config.transport.clone(),
    )?;
    let context = TransactionContext::new();
    transport
        .send(
            destination,
            TransportMessage::new(hdrs, bytes::Bytes::from(body)),
            &context,
        )
        .await?;
    context.complete().await?;

    println!("{}", message_id);
    Ok(())
}

/// Received message as printed by `receive --format json`
#[derive(Debug, Serialize)]
struct ReceivedOutput {
    headers: BTreeMap<String, String>,
    body: String,
}

impl ReceivedOutput {
    fn from_message(message: &TransportMessage) -> Self {
        Self {
            headers: message
                .headers()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: String::from_utf8_lossy(message.body()).into_owned(),
        }
    }

    fn render(&self, format: OutputFormat) -> Result<String, CliError> {
        match format {
            OutputFormat::Json => {
                serde_json::to_string(self).map_err(|e| CliError::CommandFailed {
                    message: format!("could not render message: {}", e),
                })
            }
            OutputFormat::Text => {
                let mut out = String::new();
                for (key, value) in &self.headers {
                    out.push_str(&format!("{}: {}\n", key, value));
                }
                out.push('\n');
                out.push_str(&self.body);
                Ok(out)
            }
        }
    }
}

async fn execute_receive_command(
    queue: &str,
    count: usize,
    ack: bool,
    format: OutputFormat,
    config: &CliConfig,
) -> Result<(), CliError> {
    let transport = StorageQueueTransport::new(
        build_factory(&config.connection)?,
        queue,
        config.transport.clone(),
    )?;
    transport.initialize().await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = receive_messages(&transport, count, ack, &cancel, |message| {
        println!("{}", ReceivedOutput::from_message(message).render(format)?);
        Ok(())
    })
    .await;

    transport.shutdown().await;
    let received = outcome?;
    info!(queue = %queue, received, acknowledged = ack, "Receive finished");
    Ok(())
}

/// Receive up to `count` messages, handing each to `on_message` as it arrives.
///
/// With `ack` each message is completed right away. Otherwise every lease is
/// held until the batch ends, then all messages are returned to the queue
/// together, so one batch never sees the same message twice.
pub async fn receive_messages<T, F>(
    transport: &T,
    count: usize,
    ack: bool,
    cancel: &CancellationToken,
    mut on_message: F,
) -> Result<usize, CliError>
where
    T: Transport,
    F: FnMut(&TransportMessage) -> Result<(), CliError>,
{
    let mut held = Vec::new();
    let mut received = 0;

    let outcome = loop {
        if received >= count {
            break Ok(received);
        }

        let context = TransactionContext::new();
        let message = match transport.receive(&context, cancel).await {
            Ok(Some(message)) => message,
            Ok(None) => break Ok(received),
            Err(TransportError::Cancelled) => {
                info!("Receive interrupted");
                break Ok(received);
            }
            Err(e) => {
                context.abort().await;
                break Err(e.into());
            }
        };
        received += 1;

        if let Err(e) = on_message(&message) {
            context.abort().await;
            break Err(e);
        }

        if ack {
            if let Err(e) = context.complete().await {
                break Err(e.into());
            }
        } else {
            held.push(context);
        }
    };

    for context in held {
        context.abort().await;
    }
    outcome
}

fn execute_config_show_command(format: ConfigFormat, config: &CliConfig) -> Result<(), CliError> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

/// Render the configuration with secrets redacted
pub fn render_config(config: &CliConfig, format: ConfigFormat) -> Result<String, CliError> {
    let redacted = config.redacted();
    let rendered = match format {
        ConfigFormat::Toml => toml::to_string_pretty(&redacted).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(&redacted).map_err(|e| e.to_string()),
    };

    rendered.map_err(|message| CliError::CommandFailed {
        message: format!("could not render configuration: {}", message),
    })
}
