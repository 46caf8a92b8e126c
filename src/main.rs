use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use feedbox::config::Config;
use feedbox::feed::{write_to_file, HttpFeedSource};
use feedbox::storage::Database;
use feedbox::{AddFeedOptions, FeedService, RefreshOutcome, ServiceOptions};

/// Get the config directory path (~/.config/feedbox/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedbox"))
}

#[derive(Parser, Debug)]
#[command(name = "feedbox", version, about = "Local RSS/Atom feed store")]
struct Args {
    /// Config file (default: ~/.config/feedbox/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding `database_path` from the config
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Add {
        url: String,
        /// Display name overriding the feed title
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        folder: Option<String>,
    },
    /// Unsubscribe from a feed by id
    Remove { id: String },
    /// Remove every feed and article
    Clear,
    /// List subscriptions, or the articles of one feed
    List {
        #[arg(long, value_name = "FEED_ID")]
        articles: Option<String>,
    },
    /// Re-fetch every feed, or only the given one
    Refresh { id: Option<String> },
    /// Write subscriptions as OPML to a file, or stdout
    Export {
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Subscribe to every feed in an OPML file
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.db.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
            config_dir.join("feedbox.db")
        }
    };
    let db_path = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let source = HttpFeedSource::from_config(&config).context("Failed to build HTTP client")?;
    let service = FeedService::new(Database::new(db_path), source)
        .with_options(ServiceOptions::from(&config));
    service
        .init()
        .await
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    run(&service, args.command).await
}

async fn run(service: &FeedService<HttpFeedSource>, command: Command) -> Result<()> {
    match command {
        Command::Add { url, name, folder } => {
            let feed = service
                .add_feed(
                    &url,
                    AddFeedOptions {
                        name,
                        folder_id: folder,
                    },
                )
                .await
                .with_context(|| format!("Failed to add {}", url))?;
            println!("{}\t{}\t{} articles", feed.id, feed.display_name(), feed.articles.len());
        }
        Command::Remove { id } => {
            service.remove_feed(&id).await?;
            println!("Removed {}", id);
        }
        Command::Clear => {
            service.remove_all_feeds().await?;
            println!("Removed all feeds");
        }
        Command::List { articles: None } => {
            for feed in service.get_all_feeds().await? {
                println!("{}\t{}\t{}", feed.id, feed.display_name(), feed.url);
            }
        }
        Command::List {
            articles: Some(feed_id),
        } => {
            for article in service.get_articles(&feed_id).await? {
                println!(
                    "{}\t{}\t{}",
                    article.iso_date.as_deref().unwrap_or("-"),
                    article.title.as_deref().unwrap_or("(untitled)"),
                    article.link.as_deref().unwrap_or("")
                );
            }
        }
        Command::Refresh { id: Some(id) } => match service.refresh_feed(&id).await? {
            RefreshOutcome::Updated {
                articles,
                new_articles,
            } => println!("{}: {} articles, {} new", id, articles, new_articles),
            RefreshOutcome::Removed => println!("{}: no such feed", id),
        },
        Command::Refresh { id: None } => {
            let report = service.refresh_feeds().await?;
            for failure in report.failures() {
                if let Err(e) = &failure.result {
                    eprintln!("{}\t{}", failure.url, e);
                }
            }
            println!(
                "Refreshed {} of {} feeds",
                report.succeeded(),
                report.results.len()
            );
        }
        Command::Export { output } => {
            let opml = service.export_feeds().await?;
            match output {
                Some(path) => {
                    write_to_file(&opml, &path)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{}", opml),
            }
        }
        Command::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read import file: {}", file.display()))?;
            let summary = service
                .import_feeds(&content)
                .await
                .context("Failed to import OPML")?;
            println!(
                "Imported {} feeds ({} already subscribed, {} duplicates, {} invalid)",
                summary.imported.len(),
                summary.already_subscribed,
                summary.duplicates,
                summary.invalid
            );
        }
    }
    Ok(())
}
