use clap::Parser;
use std::path::PathBuf;
use tracing::Level;
use websearch::cli::{self, Command};
use websearch::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "websearch")]
#[command(about = "Local web research appliance: crawl, chunk, embed, query")]
struct Args {
    /// State root directory (default ~/.websearch)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Embedder to use (hash, glove)
    #[arg(long, global = true)]
    embedder: Option<String>,

    /// Auto fetch mode falls back to dynamic below this content length
    #[arg(long, global = true)]
    min_static_text: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr so stdout carries exactly the JSON payload
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(Level::INFO.into())
        .add_directive("html5ever=warn".parse().expect("static directive"))
        .add_directive("selectors=warn".parse().expect("static directive"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = AppConfig::load(args.data_dir.as_deref());
    if let Some(embedder) = args.embedder {
        config.embedder = embedder;
    }
    if let Some(min) = args.min_static_text {
        config.min_static_text_len = min;
    }

    let code = cli::run(args.command, config).await;
    std::process::exit(code);
}
