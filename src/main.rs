use dotenvy::dotenv;
use linkdrop::bot::handlers::{self, Command};
use linkdrop::config::Settings;
use linkdrop::registry::Registry;
use linkdrop::snapshot::SnapshotStore;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting the bot token from log output
struct RedactionPatterns {
    token_url: Regex,
    token_bare: Regex,
    token_prefixed: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token_bare: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token_prefixed: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token_url
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token_bare
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token_prefixed
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // We return the original buffer length to satisfy the contract,
        // even if the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    init_logging(patterns);

    info!("Starting linkdrop relay bot...");

    let settings = init_settings();

    // Registry and snapshot store
    let registry = Arc::new(Registry::new(settings.registry_config()));
    let store = Arc::new(SnapshotStore::new(settings.storage_file.clone()));
    load_snapshot(&store, &registry, settings.auto_cleanup_on_start).await;
    spawn_snapshot_task(store.clone(), registry.clone(), settings.snapshot_interval());

    let bot = Bot::new(settings.telegram_token.clone());
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![registry.clone(), settings])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    // Teardown trigger: the dispatcher returned (ctrl-c), persist state.
    save_snapshot(&store, &registry).await;
    info!("Bot stopped");

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

/// Startup trigger: populate the registry from the snapshot, upgrading
/// legacy records on the way in. Load failures are non-fatal; the bot
/// starts with an empty registry.
async fn load_snapshot(store: &SnapshotStore, registry: &Registry, auto_cleanup: bool) {
    match store.load().await {
        Ok(records) => {
            registry.restore(records);
            if auto_cleanup {
                let removed = registry.prune_expired();
                if removed > 0 {
                    info!(removed, "auto-cleanup removed expired links");
                }
            }
        }
        Err(e) => {
            warn!("Failed to load snapshot, starting empty: {e}");
        }
    }
}

async fn save_snapshot(store: &SnapshotStore, registry: &Registry) {
    // The clone is taken under the registry lock; file I/O happens here,
    // outside it.
    if let Err(e) = store.save(&registry.export()).await {
        error!("Failed to save snapshot: {e}");
    }
}

fn spawn_snapshot_task(store: Arc<SnapshotStore>, registry: Arc<Registry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            save_snapshot(&store, &registry).await;
        }
    });
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_channel_post()
                .filter(|msg: Message, settings: Arc<Settings>| {
                    msg.chat.id.0 == settings.private_channel_id
                })
                .endpoint(handle_channel_post),
        )
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
}

async fn handle_channel_post(
    bot: Bot,
    msg: Message,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::auto_post(bot, msg, registry, settings).await {
        error!("Channel post handler error: {}", e);
    }
    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
) -> Result<(), teloxide::RequestError> {
    let is_admin = handlers::user_id_of(&msg) == settings.admin_user_id;
    let res = match cmd {
        Command::Start(key) => handlers::start(bot, msg, key, registry, settings).await,
        Command::Stats if is_admin => handlers::stats(bot, msg, registry, settings).await,
        Command::Cleanup if is_admin => handlers::cleanup(bot, msg, registry).await,
        Command::Healthcheck => handlers::healthcheck(bot, msg).await,
        // Admin commands from anyone else are silently ignored.
        Command::Stats | Command::Cleanup => Ok(()),
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}
