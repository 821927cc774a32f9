//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{CredentialBroker, CredentialState, SharedBroker};
use crate::client::GraphClient;
use crate::config::{Config, SearchConfig};
use crate::error::{MailError, Result};
use crate::identity::MicrosoftIdentityProvider;
use crate::models::{FormattedMessage, MessageRecord};
use crate::reader::{ConnectionStatus, MailReader, SearchQuery};
use crate::token_cache::FileTokenCache;

const PREVIEW_LIMIT: usize = 500;

#[derive(Parser, Debug)]
#[command(name = "outlook-mail")]
#[command(version = "0.1.0")]
#[command(about = "Read and filter Outlook mail through Microsoft Graph", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Path to token cache file (overrides auth.token_cache_path)
    #[arg(long)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in with the device code flow (or client credentials)
    Auth {
        /// Discard the token cache and sign in again
        #[arg(long)]
        force: bool,
    },

    /// Find messages from a sender, optionally containing a keyword
    Search {
        /// Sender address (defaults to search.sender)
        #[arg(short, long)]
        sender: Option<String>,

        /// Keyword to look for (defaults to search.keyword)
        #[arg(short, long)]
        keyword: Option<String>,

        /// Maximum messages to retrieve
        #[arg(short, long)]
        max: Option<u32>,

        /// Match case exactly
        #[arg(long)]
        case_sensitive: bool,

        /// Treat the keyword as a regular expression
        #[arg(long)]
        regex: bool,

        /// Only search subjects
        #[arg(long, conflicts_with = "body_only")]
        subject_only: bool,

        /// Only search message bodies
        #[arg(long)]
        body_only: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the most recent messages
    Messages {
        /// Maximum messages to retrieve
        #[arg(short, long, default_value_t = 25)]
        max: u32,

        /// OData $filter expression, passed through unchanged
        #[arg(short, long)]
        filter: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the mailbox is reachable with the current credentials
    TestConnection,

    /// Check which Graph permissions the current token grants
    Permissions,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Cut a preview longer than `limit` characters to `limit` plus "..."
pub fn shorten_preview(preview: &str, limit: usize) -> String {
    if preview.chars().count() > limit {
        format!("{}...", preview.chars().take(limit).collect::<String>())
    } else {
        preview.to_string()
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share the MultiProgress that log output is routed through
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        Self {
            multi,
            spinner_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        println!("  ✓ {}", msg);
    }

    pub fn fail_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        println!("  ✗ {}", msg);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a command needs to talk to the mailbox
pub struct Session {
    pub config: Config,
    pub broker: SharedBroker,
    pub reader: MailReader,
    pub token_cache: FileTokenCache,
}

/// Load configuration: `.env`, then the TOML file, then environment overrides
pub async fn load_config(cli: &Cli) -> Result<Config> {
    crate::config::load_dotenv(cli.env_file.as_deref())?;

    let mut config = Config::load(&cli.config).await?;
    config.apply_env_overrides()?;
    if let Some(path) = &cli.token_cache {
        config.auth.token_cache_path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Wire the identity provider, token cache, broker, client and reader
pub async fn build_session(config: Config) -> Result<Session> {
    let tenant = config.auth.tenant_id.as_deref().unwrap_or("common");
    let client_id = config.auth.client_id.clone().unwrap_or_default();
    let provider =
        MicrosoftIdentityProvider::with_authority_host(&config.auth.authority_host, tenant, client_id);

    let token_cache = FileTokenCache::new(&config.auth.token_cache_path);
    let mut broker = CredentialBroker::with_token_cache(
        Arc::new(provider),
        config.broker_settings(),
        Arc::new(token_cache.clone()),
    )
    .await;

    if let Some(token) = &config.auth.access_token {
        info!("Using access token from configuration");
        broker.set_access_token(
            token.clone(),
            Duration::from_secs(config.auth.access_token_ttl_secs),
        );
    }

    let broker = broker.into_shared();
    let client = GraphClient::with_options(broker.clone(), &config.graph.base_url, config.timeout())?;
    let reader = MailReader::new(Arc::new(client))
        .with_retry_policy(config.graph.max_retries, config.retry_delay());

    Ok(Session {
        config,
        broker,
        reader,
        token_cache,
    })
}

/// Make sure the broker holds a usable token, prompting for the device code
/// flow when nothing silent is left
pub async fn ensure_authenticated(session: &Session, reporter: &ProgressReporter) -> Result<()> {
    let mut broker = session.broker.lock().await;

    if let Some(secret) = &session.config.auth.client_secret {
        broker.use_client_credentials(secret.clone());
        if broker.state() != CredentialState::Valid {
            let spinner = reporter.add_spinner("Acquiring application token...");
            if let Err(e) = broker.get_valid_token().await {
                reporter.fail_spinner(&spinner, "Application token request failed");
                return Err(e);
            }
            reporter.finish_spinner(&spinner, "Application token acquired");
        }
        return Ok(());
    }

    match broker.get_valid_token().await {
        Ok(_) => return Ok(()),
        Err(e) if e.requires_interactive_auth() => {
            info!("No usable token, starting device code flow");
        }
        Err(e) => return Err(e),
    }

    let challenge = broker.begin_interactive_auth().await?;
    let _ = reporter.multi_progress().println(match &challenge.message {
        Some(message) => message.clone(),
        None => format!(
            "To sign in, open {} and enter the code {}",
            challenge.verification_uri, challenge.user_code
        ),
    });

    let spinner = reporter.add_spinner("Waiting for sign-in to complete...");
    match broker.complete_interactive_auth().await {
        Ok(()) => {
            reporter.finish_spinner(&spinner, "Signed in");
            Ok(())
        }
        Err(e) => {
            reporter.fail_spinner(&spinner, "Sign-in failed");
            Err(e)
        }
    }
}

/// Print a formatted message block
pub fn print_message_details(message: &FormattedMessage, index: Option<usize>) {
    let rule = "=".repeat(80);
    println!("\n{}", rule);
    match index {
        Some(i) => println!("EMAIL #{}", i + 1),
        None => println!("EMAIL DETAILS"),
    }
    println!("{}", rule);

    println!("Date: {}", message.timestamp);
    println!("From: {} <{}>", message.sender_name, message.sender_email);
    println!("Subject: {}", message.subject);

    if !message.preview.is_empty() {
        println!("\nPreview:");
        println!("   {}", shorten_preview(&message.preview, PREVIEW_LIMIT));
    }

    if !message.outlook_link.is_empty() {
        println!("\nOutlook Link: {}", message.outlook_link);
    }
    println!("{}", rule);
}

fn print_messages(messages: &[MessageRecord], json: bool) -> Result<()> {
    let formatted: Vec<FormattedMessage> = messages.iter().map(MessageRecord::format).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&formatted)?);
        return Ok(());
    }
    for (i, message) in formatted.iter().enumerate() {
        print_message_details(message, Some(i));
    }
    Ok(())
}

pub async fn run_auth(cli: &Cli, force: bool, reporter: &ProgressReporter) -> Result<()> {
    let config = load_config(cli).await?;
    let cache = FileTokenCache::new(&config.auth.token_cache_path);
    if force {
        cache.clear().await?;
    }

    let session = build_session(config).await?;
    ensure_authenticated(&session, reporter).await?;

    println!("Successfully authenticated with Microsoft Graph");
    println!("Token cached at: {:?}", session.token_cache.path());

    match session.reader.test_connection().await {
        ConnectionStatus::Connected {
            user_principal_name,
        } => println!("Connected to account: {}", user_principal_name),
        ConnectionStatus::Failed { reason } => warn!("Signed in, but connection test failed: {}", reason),
    }
    Ok(())
}

/// Command-line search flags layered over the `[search]` section
#[allow(clippy::too_many_arguments)]
fn build_search_query(
    base: &SearchConfig,
    sender: Option<String>,
    keyword: Option<String>,
    max: Option<u32>,
    case_sensitive: bool,
    regex: bool,
    subject_only: bool,
    body_only: bool,
) -> Result<SearchQuery> {
    let mut search = base.clone();
    if sender.is_some() {
        search.sender = sender;
    }
    if keyword.is_some() {
        search.keyword = keyword;
    }
    if let Some(max) = max {
        search.max_items = max;
    }
    search.case_sensitive |= case_sensitive;
    search.use_regex |= regex;
    if subject_only {
        search.search_in_subject = true;
        search.search_in_body = false;
    }
    if body_only {
        search.search_in_subject = false;
        search.search_in_body = true;
    }

    search.to_query().ok_or_else(|| {
        MailError::ConfigError(
            "No sender given: pass --sender or set search.sender (SENDER_FILTER)".to_string(),
        )
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    cli: &Cli,
    reporter: &ProgressReporter,
    sender: Option<String>,
    keyword: Option<String>,
    max: Option<u32>,
    case_sensitive: bool,
    regex: bool,
    subject_only: bool,
    body_only: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(cli).await?;

    let query = build_search_query(
        &config.search,
        sender,
        keyword,
        max,
        case_sensitive,
        regex,
        subject_only,
        body_only,
    )?;

    let session = build_session(config).await?;
    ensure_authenticated(&session, reporter).await?;

    let spinner = reporter.add_spinner(&format!("Searching messages from {}...", query.sender));
    let messages = match session.reader.search_emails(&query).await {
        Ok(messages) => messages,
        Err(e) => {
            reporter.fail_spinner(&spinner, "Search failed");
            return Err(e);
        }
    };
    reporter.finish_spinner(&spinner, &format!("Found {} message(s)", messages.len()));

    let keyword_label = query.keyword.as_deref().unwrap_or("");
    if messages.is_empty() && !json {
        println!(
            "\nNo emails found from {} containing '{}'",
            query.sender, keyword_label
        );
        return Ok(());
    }
    if !json {
        println!(
            "\nFound {} emails from {} containing '{}'",
            messages.len(),
            query.sender,
            keyword_label
        );
    }
    print_messages(&messages, json)
}

pub async fn run_messages(
    cli: &Cli,
    reporter: &ProgressReporter,
    max: u32,
    filter: Option<String>,
    json: bool,
) -> Result<()> {
    let session = build_session(load_config(cli).await?).await?;
    ensure_authenticated(&session, reporter).await?;

    let spinner = reporter.add_spinner("Fetching messages...");
    let messages = match session.reader.get_messages(max, filter.as_deref()).await {
        Ok(messages) => messages,
        Err(e) => {
            reporter.fail_spinner(&spinner, "Fetching messages failed");
            return Err(e);
        }
    };
    reporter.finish_spinner(&spinner, &format!("Retrieved {} message(s)", messages.len()));
    print_messages(&messages, json)
}

pub async fn run_test_connection(cli: &Cli, reporter: &ProgressReporter) -> Result<()> {
    let session = build_session(load_config(cli).await?).await?;
    ensure_authenticated(&session, reporter).await?;

    match session.reader.test_connection().await {
        ConnectionStatus::Connected {
            user_principal_name,
        } => {
            println!("Connected as {}", user_principal_name);
            Ok(())
        }
        ConnectionStatus::Failed { reason } => Err(MailError::NetworkError(format!(
            "Connection test failed: {}",
            reason
        ))),
    }
}

pub async fn run_permissions(cli: &Cli, reporter: &ProgressReporter) -> Result<()> {
    let session = build_session(load_config(cli).await?).await?;
    ensure_authenticated(&session, reporter).await?;

    let permissions = session.reader.check_permissions().await;
    println!("\nPermissions:");
    for (scope, granted) in &permissions {
        println!("  {} {}", if *granted { "✓" } else { "✗" }, scope);
    }
    if permissions.values().any(|granted| !granted) {
        println!("\nMissing permissions must be granted to the app registration in Entra ID.");
    }
    Ok(())
}

pub async fn run_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(MailError::ConfigError(format!(
            "Configuration file already exists at {:?}. Use --force to overwrite.",
            output
        )));
    }

    Config::create_example(output).await?;

    println!("Created example configuration file at: {:?}", output);
    println!("\nPlease edit this file to customize your settings.");
    println!("Key settings to review:");
    println!("  - auth.tenant_id / auth.client_id: your Entra ID app registration");
    println!("  - search.sender: the sender address to search");
    println!("  - search.keyword: the keyword to look for");
    println!("  - graph.max_retries / graph.retry_delay_secs: retry policy");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten_preview() {
        assert_eq!(shorten_preview("short", 10), "short");
        assert_eq!(shorten_preview("exactly10!", 10), "exactly10!");
        assert_eq!(shorten_preview("this is too long", 10), "this is to...");
        assert_eq!(shorten_preview("ünïcödé text", 5), "ünïcö...");

        let at_limit = "a".repeat(PREVIEW_LIMIT);
        assert_eq!(shorten_preview(&at_limit, PREVIEW_LIMIT), at_limit);
        let over = "b".repeat(PREVIEW_LIMIT + 1);
        let shortened = shorten_preview(&over, PREVIEW_LIMIT);
        assert_eq!(shortened.chars().count(), PREVIEW_LIMIT + 3);
        assert!(shortened.ends_with("b..."));
    }

    #[test]
    fn test_cli_parses_search() {
        let cli = Cli::parse_from([
            "outlook-mail",
            "--verbose",
            "search",
            "--sender",
            "alerts@example.com",
            "--keyword",
            "failed",
            "--max",
            "10",
            "--subject-only",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Search {
                sender,
                keyword,
                max,
                subject_only,
                body_only,
                ..
            } => {
                assert_eq!(sender.as_deref(), Some("alerts@example.com"));
                assert_eq!(keyword.as_deref(), Some("failed"));
                assert_eq!(max, Some(10));
                assert!(subject_only);
                assert!(!body_only);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_subject_and_body_only_conflict() {
        let result = Cli::try_parse_from([
            "outlook-mail",
            "search",
            "--subject-only",
            "--body-only",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["outlook-mail", "messages"]);
        assert_eq!(cli.config, PathBuf::from("config.toml"));
        assert!(cli.token_cache.is_none());
        assert!(!cli.log_json);
        assert!(matches!(
            cli.command,
            Commands::Messages {
                max: 25,
                filter: None,
                json: false
            }
        ));
    }

    #[test]
    fn test_search_flags_override_config() {
        let base = SearchConfig {
            sender: Some("alerts@example.com".to_string()),
            ..SearchConfig::default()
        };

        let query = build_search_query(&base, None, None, None, false, false, false, false)
            .unwrap();
        assert_eq!(query, base.to_query().unwrap());

        let query = build_search_query(
            &base,
            Some("billing@example.com".to_string()),
            Some("declined".to_string()),
            Some(10),
            true,
            true,
            false,
            true,
        )
        .unwrap();
        assert_eq!(query.sender, "billing@example.com");
        assert_eq!(query.keyword.as_deref(), Some("declined"));
        assert_eq!(query.max_items, 10);
        assert!(query.options.case_sensitive);
        assert!(query.options.use_regex);
        assert!(!query.options.search_in_subject);
        assert!(query.options.search_in_body);
    }

    #[test]
    fn test_search_without_sender_is_config_error() {
        let err = build_search_query(
            &SearchConfig::default(),
            None,
            None,
            None,
            false,
            false,
            true,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("--sender"));
    }

    #[tokio::test]
    async fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        run_init_config(&path, false).await.unwrap();
        let err = run_init_config(&path, false).await.unwrap_err();
        assert!(err.to_string().contains("--force"));
        run_init_config(&path, true).await.unwrap();
    }
}
