use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use findme_core::SimilarityIndex;
use findme_service::{spawn_engine, Config, MatchOptions, PhotoListing};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "findme", about = "FindMe face search for the photo marketplace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a sellable photo and add it to the catalog
    Index {
        /// Image file to index
        image: PathBuf,
        /// Seller user id
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
        /// Price in the smallest currency unit
        #[arg(long)]
        base_price: u64,
        /// Price in the smallest currency unit
        #[arg(long)]
        sell_price: u64,
    },
    /// Register a reference face for a user
    Register {
        /// Image file with exactly one face
        image: PathBuf,
        #[arg(short, long)]
        user: String,
    },
    /// Find listed photos containing a user's face
    Match {
        #[arg(short, long)]
        user: String,
        /// Probe image; the user's latest reference face is used if omitted
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Squared L2 distance threshold
        #[arg(long)]
        threshold: Option<f32>,
        /// Maximum number of index hits to consider
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List a user's reference faces
    References {
        #[arg(short, long)]
        user: String,
    },
    /// Show index size and configured paths
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Status => status(&config),
        command => run(command, &config).await,
    }
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    let engine = spawn_engine(config).context("starting engine")?;

    match command {
        Commands::Index {
            image,
            owner,
            name,
            description,
            base_price,
            sell_price,
        } => {
            let listing = PhotoListing {
                name,
                description,
                base_price,
                sell_price,
                filename: file_name(&image),
            };
            let bytes = read_image(&image)?;
            let indexed = engine.index_photo(owner, bytes, listing).await?;
            print_json(&indexed)?;
        }
        Commands::Register { image, user } => {
            let bytes = read_image(&image)?;
            let summary = engine.register_reference(user, bytes, file_name(&image)).await?;
            print_json(&summary)?;
        }
        Commands::Match {
            user,
            image,
            threshold,
            limit,
        } => {
            let defaults = engine.default_options();
            let options = MatchOptions {
                threshold: threshold.unwrap_or(defaults.threshold),
                limit: limit.unwrap_or(defaults.limit),
            };
            let probe = image.as_deref().map(read_image).transpose()?;
            let matches = engine.find_matches(user, probe, Some(options)).await?;
            print_json(&matches)?;
        }
        Commands::References { user } => {
            let references = engine.list_references(user).await?;
            print_json(&references)?;
        }
        Commands::Status => status(config)?,
    }

    Ok(())
}

/// Reports without loading models, so it works before they are installed.
/// The index file is only read; a bad or mismatched file is reported, never
/// moved.
fn status(config: &Config) -> Result<()> {
    let index_path = config.index_path();
    let index = match SimilarityIndex::inspect(&index_path) {
        Ok(Some(info)) => serde_json::json!({
            "slots": info.slots,
            "dimension": info.dimension,
            "dimension_matches_config": info.dimension == config.embedding_dim,
        }),
        Ok(None) => serde_json::Value::Null,
        Err(err) => serde_json::json!({ "error": err.to_string() }),
    };
    let detector = PathBuf::from(config.detector_model_path());
    let embedder = PathBuf::from(config.embedder_model_path());
    print_json(&serde_json::json!({
        "index": index,
        "embedding_dim": config.embedding_dim,
        "index_path": index_path,
        "catalog_path": config.catalog_path(),
        "blob_dir": config.blob_dir(),
        "detector_model": { "path": detector, "present": detector.exists() },
        "embedder_model": { "path": embedder, "present": embedder.exists() },
        "match_threshold": config.match_threshold,
        "match_limit": config.match_limit,
        "l2_normalize": config.l2_normalize,
    }))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
