use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use docsift::application::application::Application;
use docsift::application::config::configuration::Configuration;

#[derive(Parser)]
#[clap(author, version, about = "Local full-text search over your folders")]
struct Cli {
    #[clap(flatten)]
    config: Configuration,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an index over a folder tree and run the initial scan
    Index {
        path: PathBuf,
        /// Extensions to index, with or without the leading dot
        #[clap(long = "ext", default_values_t = default_extensions())]
        extensions: Vec<String>,
    },
    /// Drop the index for a previously indexed folder
    Remove { path: PathBuf },
    /// Search indexed folders; with no folders given, search all of them
    Search {
        query: String,
        folders: Vec<PathBuf>,
    },
    /// Show the terms a query would highlight in the preview
    Terms { query: String },
    /// List open indexes and their stats
    List,
}

fn default_extensions() -> Vec<String> {
    [".txt", ".log", ".md", ".go", ".py", ".rs"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    Application::install_logging(&cli.config);
    let app = Application::initialize(cli.config).await?;

    match cli.command {
        Command::Index { path, extensions } => {
            let extensions: BTreeMap<String, bool> = extensions
                .iter()
                .map(|ext| {
                    let ext = ext.trim_start_matches('.').to_lowercase();
                    (format!(".{ext}"), true)
                })
                .collect();
            app.registry.index_folder(&path, extensions).await?;
            for (name, stats) in app.registry.stats() {
                println!("{name}: {stats}");
            }
        }
        Command::Remove { path } => {
            app.registry.remove_folder(&path).await?;
            println!("removed {}", path.display());
        }
        Command::Search { query, folders } => {
            let folders = if folders.is_empty() {
                app.registry.roots()
            } else {
                folders
            };
            let hits = app.registry.search(&query, &folders).await?;
            for hit in &hits {
                println!(
                    "{:>8.3}  {:>10}  {}  {}",
                    hit.score,
                    hit.size,
                    hit.mod_time,
                    hit.path.display()
                );
            }
            println!("{} hits", hits.len());
        }
        Command::Terms { query } => {
            for term in app.registry.extract_terms(&query)? {
                println!("{term}");
            }
        }
        Command::List => {
            for (name, stats) in app.registry.stats() {
                println!("{name}: {stats}");
            }
        }
    }

    app.shutdown().await;
    Ok(())
}
