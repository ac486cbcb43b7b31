use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facecheck_core::{
    purge_images, spawn_extractor, FaceService, FsImageStore, IdentifyOutcome, MissReason,
    Registry, Tolerance,
};
use facecheck_models::{OnnxExtractor, ARCFACE_EMBEDDING_DIM};
use facecheckd::config::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facecheck", about = "facecheck event and face administration")]
struct Cli {
    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage events
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Manage registered faces
    Faces {
        #[command(subcommand)]
        command: FaceCommands,
    },
    /// Register a face from an image file
    Register {
        /// Event ID to register into
        #[arg(short, long)]
        event: i64,
        /// Display name of the person
        #[arg(short, long)]
        name: String,
        /// Path to the image
        image: PathBuf,
    },
    /// Identify the face in an image file
    Identify {
        /// Event ID to search
        #[arg(short, long)]
        event: i64,
        /// Maximum distance for a match (defaults to FACECHECK_TOLERANCE)
        #[arg(short, long)]
        tolerance: Option<f32>,
        /// Path to the image
        image: PathBuf,
    },
}

#[derive(Subcommand)]
enum EventCommands {
    /// List events
    List,
    /// Create an event
    Create { name: String },
    /// Delete an event with all of its faces
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum FaceCommands {
    /// List faces across all events
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Events { command } => {
            let registry = open_registry(&config).await?;
            match command {
                EventCommands::List => {
                    let groups = registry.list_groups().await?;
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&groups)?);
                    } else if groups.is_empty() {
                        println!("No events");
                    } else {
                        for g in groups {
                            println!("{:>4}  {}  (created {})", g.id, g.name, g.created_at);
                        }
                    }
                }
                EventCommands::Create { name } => {
                    let group = registry.create_group(&name).await?;
                    println!("Created event {} ({})", group.id, group.name);
                }
                EventCommands::Delete { id } => {
                    let removed = registry.delete_group(id).await?;
                    let images = FsImageStore::new(&config.image_dir)?;
                    purge_images(&images, &removed);
                    println!("Deleted event {id} and {} face(s)", removed.len());
                }
            }
        }
        Commands::Faces { command: FaceCommands::List } => {
            let registry = open_registry(&config).await?;
            let entries = registry.list_all_entries().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No faces registered");
            } else {
                for e in entries {
                    println!(
                        "{:>4}  {:<24} {} [{}]",
                        e.id, e.display_name, e.group_name, e.group_id
                    );
                }
            }
        }
        Commands::Register { event, name, image } => {
            let bytes = read_image(&image)?;
            let service = open_service(&config).await?;
            let entry = service.register(event, &name, bytes).await?;
            println!("Registered {} as face {} in event {event}", entry.display_name, entry.id);
        }
        Commands::Identify {
            event,
            tolerance,
            image,
        } => {
            let tolerance = match tolerance {
                Some(t) => Tolerance::new(t)?,
                None => config.tolerance,
            };
            let bytes = read_image(&image)?;
            let service = open_service(&config).await?;
            match service.identify_from_image(event, bytes, tolerance).await? {
                IdentifyOutcome::Recognized { entry, distance } => {
                    println!("Match: {} (face {}, distance {distance:.4})", entry.display_name, entry.id);
                }
                IdentifyOutcome::NoFaceDetected => println!("No face detected"),
                IdentifyOutcome::UnknownGroup => bail!("unknown event: {event}"),
                IdentifyOutcome::NotRecognized(MissReason::NothingRegistered) => {
                    println!("No registered faces in this event");
                }
                IdentifyOutcome::NotRecognized(MissReason::NoMatch) => println!("No match"),
            }
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Registry only; admin commands do not need the models.
async fn open_registry(config: &Config) -> Result<Registry> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Registry::open(&config.db_path, ARCFACE_EMBEDDING_DIM)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))
}

async fn open_service(config: &Config) -> Result<FaceService> {
    let registry = open_registry(config).await?;
    let extractor = OnnxExtractor::load_dir(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let extractor = spawn_extractor(extractor, config.extract_timeout())?;
    let images = FsImageStore::new(&config.image_dir)?;
    Ok(FaceService::new(registry, extractor, Arc::new(images)).with_policy(config.face_policy))
}
