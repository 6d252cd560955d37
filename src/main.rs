//! quire entry point.

use clap::Parser;
use quire::{
    config::{Cli, Command, Config, SourceArg, TargetArg},
    formats::ManuscriptSource,
    history::ReaderIdentity,
    ingest::UploadRequest,
    library::StorageTarget,
    server::{self, AppState},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quire=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        Some(Command::Upload {
            file,
            title,
            author,
            genres,
            cover,
            chapter,
            chapter_title,
            target,
            reader,
        }) => {
            let upload = UploadArgs {
                file,
                title,
                author,
                genres,
                cover,
                chapter,
                chapter_title,
                target,
                reader,
            };
            cmd_upload(config, upload).await
        }
        Some(Command::Read {
            book_id,
            chapter,
            source,
            reader,
            prefetch,
        }) => cmd_read(config, &book_id, chapter, source, reader, prefetch).await,
        Some(Command::History { reader }) => cmd_history(config, reader).await,
        None => cmd_serve(config, None).await,
    }
}

/// Write the default config and create the stores.
fn cmd_init(force: bool) -> anyhow::Result<()> {
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
    AppState::open(config.clone())?;
    println!("Initialized device store: {}", config.storage.local_db.display());
    println!("Initialized catalog store: {}", config.storage.remote_db.display());

    println!("\nEdit config.toml to list approved contributors under [auth].");
    println!("Then run: quire upload <file> --title <title> --author <author>");

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    let bind = config.server.bind;
    let state = AppState::open(config)?;
    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

struct UploadArgs {
    file: PathBuf,
    title: Option<String>,
    author: Option<String>,
    genres: Vec<String>,
    cover: Option<PathBuf>,
    chapter: Option<u32>,
    chapter_title: Option<String>,
    target: TargetArg,
    reader: Option<String>,
}

/// Upload a manuscript from disk.
async fn cmd_upload(config: Config, args: UploadArgs) -> anyhow::Result<()> {
    let state = AppState::open(config)?;
    let tier = state.authorizer.tier(args.reader.as_deref());

    let source = ManuscriptSource::from_file(&args.file)?
        .with_chapter_number(args.chapter)
        .with_chapter_title(args.chapter_title);
    let cover = match &args.cover {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    let result = state
        .ingestor
        .upload(UploadRequest {
            source,
            title: args.title,
            author: args.author,
            genres: args.genres,
            cover,
            tier,
            preference: args.target.into(),
        })
        .await;

    match result {
        Ok(outcome) => {
            println!(
                "Saved {} chapters of {} to {} storage ({:?})",
                outcome.report.chapters_written,
                outcome.report.book_id,
                outcome.report.target,
                outcome.decision.reason
            );
            if let Some(cover_ref) = &outcome.report.cover_ref {
                println!("Cover: {}", cover_ref);
            }
            Ok(())
        }
        Err(e) => anyhow::bail!(e.write_message()),
    }
}

fn reader_identity(config: &Config, reader: Option<String>) -> ReaderIdentity {
    ReaderIdentity {
        device_id: config.device.id.clone(),
        user_id: reader,
    }
}

/// Print one chapter, optionally prefetching the ones after it.
async fn cmd_read(
    config: Config,
    book_id: &str,
    chapter: u32,
    source: SourceArg,
    reader: Option<String>,
    prefetch: u32,
) -> anyhow::Result<()> {
    let reader = reader_identity(&config, reader);
    let state = AppState::open(config)?;
    let target = StorageTarget::from(source);

    let shelf = state.shelf(&reader, target);
    let mut shelf = shelf.lock().await;
    let session = shelf.open(book_id);

    let text = session.get(chapter).await?;
    if prefetch > 0 {
        let report = session
            .prefetch_range(chapter.saturating_add(1), prefetch)
            .await;
        tracing::info!(
            fetched = report.fetched,
            missing = ?report.missing,
            failed = ?report.failed,
            "Prefetched"
        );
    }

    if let Some(title) = &text.title {
        println!("{}\n", title);
    }
    println!("{}", text.content);
    println!(
        "\n[{} of the next {} chapters ready]",
        session.preloaded_count(chapter.saturating_add(1), prefetch.max(1)),
        prefetch.max(1)
    );

    Ok(())
}

/// Print merged reading history.
async fn cmd_history(config: Config, reader: Option<String>) -> anyhow::Result<()> {
    let reader = reader_identity(&config, reader);
    let state = AppState::open(config)?;

    let history = state.history.load(&reader).await?;
    if history.is_empty() {
        println!("No reading history.");
        return Ok(());
    }

    println!("{:<36} {:<8} {:<8} TITLE", "BOOK", "CHAPTER", "SOURCE");
    println!("{}", "-".repeat(80));
    for entry in history {
        println!(
            "{:<36} {:<8} {:<8} {}",
            entry.book_id,
            entry.last_read_chapter,
            if entry.is_remote { "remote" } else { "local" },
            entry.title.as_deref().unwrap_or("")
        );
    }

    Ok(())
}
