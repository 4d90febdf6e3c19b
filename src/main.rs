//! camgate entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camgate::blobref::BlobRef;
use camgate::auth::AuthCheck;
use camgate::config::{Args, Command};
use camgate::schema;
use camgate::server::{self, AppState};
use camgate::store::MemoryStore;
use camgate::types::Result;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("camgate={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let outcome = match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(args).await,
        Command::Ref { text } => cmd_ref(&text),
        Command::Upbytes { file } => cmd_upbytes(&args, file).await,
        Command::Hash { files } => cmd_hash(&files).await,
    };
    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(args: Args) -> Result<()> {
    let auth = if args.noauth {
        None
    } else {
        std::env::var("CAMLI_AUTH")
            .ok()
            .and_then(|spec| AuthCheck::from_spec(&spec))
    };
    if auth.is_none() {
        info!("authentication disabled");
    }
    let state = Arc::new(AppState::new(args, auth));
    server::run(state).await
}

/// Print the other form of a ref: canonical in, short out, and back.
fn cmd_ref(text: &str) -> Result<()> {
    match BlobRef::parse(text) {
        Ok(br) => println!("{}", br.to_base64()),
        Err(_) => {
            let br = BlobRef::parse_base64(text)?;
            println!("{br}");
        }
    }
    Ok(())
}

async fn cmd_upbytes(args: &Args, file: Option<PathBuf>) -> Result<()> {
    let registry = camgate::registry::Registry::new(args.registry_config());
    let uploader = registry.uploader(&args.server)?;
    let content = match file {
        Some(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "stdin".to_string());
            let fh = tokio::fs::File::open(&path).await?;
            uploader.upload_reader(&name, fh).await?
        }
        None => uploader.upload_reader("stdin", tokio::io::stdin()).await?,
    };
    println!("{content}");
    Ok(())
}

/// Compute the file-schema ref of each file against a throwaway store.
async fn cmd_hash(files: &[PathBuf]) -> Result<()> {
    let store = MemoryStore::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let fh = tokio::fs::File::open(path).await?;
        let br = schema::write_file_from_reader(&store, &name, fh).await?;
        println!("{br}  {}", path.display());
    }
    Ok(())
}
