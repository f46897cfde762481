//! ebook-shelf entry point.

use clap::Parser;
use ebook_shelf::{
    auth::AuthService,
    config::{Cli, Command, Config, UserCommand},
    ingest::{IngestEvent, Payload, Pipeline, repair},
    library::StorageLayout,
    server,
    store::Store,
};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ebook_shelf=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Import {
            username,
            files,
            archive,
            map_tags,
        }) => cmd_import(&config, &username, files, archive, map_tags).await,
        Some(Command::Repair { prune }) => cmd_repair(&config, prune).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
    }
}

/// Create the data directories of both stores.
fn prepare_dirs(config: &Config) -> anyhow::Result<()> {
    for path in [&config.database.catalog_path, &config.database.app_path] {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::create_dir_all(&config.storage.data_dir)?;
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    prepare_dirs(config)?;
    Ok(Store::open(config)?)
}

/// Initialize config and databases.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    open_store(&config)?;
    println!(
        "Initialized databases: {} and {}",
        config.database.catalog_path.display(),
        config.database.app_path.display()
    );

    println!("\nEdit config.toml to configure your server.");
    println!("Then run: ebook-shelf user add <username> --password <password> --role admin");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let auth = AuthService::new(
        store,
        config.auth.session_days,
        config.auth.registration_enabled(),
    );

    match action {
        UserCommand::Add {
            username,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&username, &password, &role)?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username, user.role, user.id
            );
        }

        UserCommand::Del { username } => {
            if auth.delete_user(&username)? {
                println!("Deleted user: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<20} {:<10} {:<8} LAST LOGIN", "USERNAME", "ROLE", "ID");
                println!("{}", "-".repeat(60));
                for user in users {
                    let last_login = user
                        .last_login
                        .map(|ts| {
                            chrono::DateTime::from_timestamp(ts, 0)
                                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_else(|| "unknown".to_string())
                        })
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<20} {:<10} {:<8} {}",
                        user.username, user.role, user.id, last_login
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }
    }

    Ok(())
}

/// Ingest local files and archives as one batch and wait for every outcome.
async fn cmd_import(
    config: &Config,
    username: &str,
    files: Vec<PathBuf>,
    archive: Option<PathBuf>,
    map_tags: bool,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let user = store
        .app
        .get_user_by_username(username)?
        .ok_or_else(|| anyhow::anyhow!("User not found: {}", username))?;

    let shutdown = CancellationToken::new();
    let pipeline = Arc::new(Pipeline::start(store, config, shutdown.clone()));
    let mut events = pipeline.subscribe();

    let mut jobs = Vec::new();
    if !files.is_empty() {
        let payloads = files
            .into_iter()
            .map(|path| Payload::LocalFile { path })
            .collect();
        jobs.extend(pipeline.ingest_batch(user.id, payloads)?);
    }
    if let Some(path) = archive {
        let bytes = tokio::fs::read(&path).await?;
        jobs.extend(pipeline.import_archive(user.id, bytes, map_tags).await?);
    }
    if jobs.is_empty() {
        pipeline.shutdown().await;
        anyhow::bail!("Nothing to import");
    }

    let expected: HashSet<i64> = jobs.iter().map(|job| job.id).collect();
    let mut remaining = expected.len();
    let (mut ingested, mut skipped, mut failed) = (0usize, 0usize, 0usize);
    println!("Queued {} jobs", remaining);

    while remaining > 0 {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, cancelling remaining jobs");
                break;
            }
        };

        match event {
            Ok(event) if expected.contains(&event.job_id()) => {
                remaining -= 1;
                match event {
                    IngestEvent::Ingested { book_id, .. } => {
                        ingested += 1;
                        println!("  ingested book {}", book_id);
                    }
                    IngestEvent::Skipped { existing_id, .. } => {
                        skipped += 1;
                        println!("  duplicate of book {}", existing_id);
                    }
                    IngestEvent::Failed { message, .. } => {
                        failed += 1;
                        println!("  failed: {}", message);
                    }
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                // Only this command's jobs run here, so every missed event is ours.
                let missed = usize::try_from(missed).unwrap_or(usize::MAX);
                remaining = remaining.saturating_sub(missed);
                println!("  {} outcomes missed, see `jobs` in the database", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }

    pipeline.shutdown().await;
    println!(
        "Import finished: {} ingested, {} duplicates, {} failed",
        ingested, skipped, failed
    );
    Ok(())
}

/// Reconcile the application store with the catalog.
async fn cmd_repair(config: &Config, prune: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let layout = StorageLayout::new(&config.storage.data_dir);

    let report = tokio::task::spawn_blocking(move || repair::repair(&store, &layout, prune)).await??;
    println!(
        "Checked {} books: {} hash links and {} user links restored, {} failures, {} directories pruned",
        report.books, report.hash_links, report.user_links, report.failures, report.pruned
    );
    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    let store = open_store(&config)?;
    tracing::info!(
        bind = %config.server.bind,
        catalog = %config.database.catalog_path.display(),
        app = %config.database.app_path.display(),
        data_dir = %config.storage.data_dir.display(),
        "Starting ebook-shelf server"
    );

    let shutdown = CancellationToken::new();
    let pipeline = Arc::new(Pipeline::start(store.clone(), &config, shutdown.clone()));

    let state = server::AppState::new(config.clone(), store, Arc::clone(&pipeline));
    match state.auth.cleanup_sessions() {
        Ok(removed) if removed > 0 => tracing::info!(removed, "Removed expired sessions"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to clean up sessions"),
    }

    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
            signal.cancel();
        })
        .await?;

    pipeline.shutdown().await;
    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
