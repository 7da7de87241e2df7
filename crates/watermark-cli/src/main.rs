//! Command-line interface for watermark administration and application

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use watermark_core::codec;
use watermark_core::{
    init_logging_with, version, AppConfig, AssignmentTarget, Compositor, ConfigManager,
    DatabaseManager, NewWatermarkSet, NewWatermarkSetting, OrientationType, ResolutionSource,
    ResourceId, ResourceRef, ResourceType, SetId, SettingId, Trigger, WatermarkApplicator,
    WatermarkPosition, WatermarkSet, WatermarkSetUpdate, WatermarkSettingUpdate, WatermarkStore,
};

#[derive(Parser)]
#[command(name = "watermark")]
#[command(about = "Resolve, assign and apply watermarks to catalog media")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL or path, overriding the configuration
    #[arg(long, global = true)]
    database: Option<String>,

    /// Files root, overriding the configuration
    #[arg(long, global = true)]
    files: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version and effective configuration
    Info,

    /// Show the watermark set that applies to a resource
    Resolve {
        /// Resource type (item, item_set, media)
        resource_type: ResourceType,
        /// Resource id
        id: ResourceId,
    },

    /// Assign a watermark set to a resource
    Assign {
        /// Resource type (item, item_set, media)
        resource_type: ResourceType,
        /// Resource id
        id: ResourceId,
        /// Watermark set id, `none` to opt out, or `default` to inherit again
        target: AssignmentTarget,
    },

    /// Manage watermark sets
    #[command(subcommand)]
    Set(SetCommand),

    /// Manage the settings inside a watermark set
    #[command(subcommand)]
    Setting(SettingCommand),

    /// Register catalog resources
    #[command(subcommand)]
    Catalog(CatalogCommand),

    /// Watermark the derivatives of media
    Apply {
        /// Media ids to process
        #[arg(short, long, num_args = 1.., conflicts_with_all = ["item", "all"])]
        media: Vec<ResourceId>,

        /// Process every media of this item
        #[arg(long, conflicts_with = "all")]
        item: Option<ResourceId>,

        /// Process every media in the catalog
        #[arg(long)]
        all: bool,

        /// Event that triggered the run (upload, import, manual)
        #[arg(short, long, default_value = "manual")]
        trigger: Trigger,
    },

    /// Composite a watermark onto a single image file
    Composite {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Watermark file path
        #[arg(short, long)]
        watermark: PathBuf,

        /// Watermark position
        #[arg(short, long, default_value = "bottom-right")]
        position: WatermarkPosition,

        /// Watermark opacity (0.0-1.0)
        #[arg(long, default_value = "1.0")]
        opacity: f32,
    },
}

#[derive(Subcommand)]
enum SetCommand {
    /// Create a watermark set
    Create {
        name: String,
        /// Make this the default set
        #[arg(long)]
        default: bool,
        /// Create the set disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List all watermark sets
    List,
    /// Show one watermark set with its settings
    Show { id: SetId },
    /// Rename, enable or disable a watermark set
    Update {
        id: SetId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Make a watermark set the default
    Default { id: SetId },
    /// Delete a watermark set and its settings
    Delete { id: SetId },
}

#[derive(Args)]
struct SettingArgs {
    /// Orientation the setting applies to (all, landscape, portrait, square)
    #[arg(long = "type")]
    orientation_type: Option<OrientationType>,
    /// Watermark position
    #[arg(long)]
    position: Option<WatermarkPosition>,
    /// Watermark opacity (0.0-1.0)
    #[arg(long)]
    opacity: Option<f32>,
    /// Watermark image, relative to the files root
    #[arg(long)]
    image: Option<String>,
}

#[derive(Subcommand)]
enum SettingCommand {
    /// Add a setting to a watermark set
    Add {
        set_id: SetId,
        #[command(flatten)]
        args: SettingArgs,
    },
    /// Change a setting
    Update {
        id: SettingId,
        #[command(flatten)]
        args: SettingArgs,
    },
    /// Remove a setting
    Delete { id: SettingId },
}

#[derive(Subcommand)]
enum CatalogCommand {
    /// Register an item set
    ItemSet {
        id: ResourceId,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Register an item
    Item {
        id: ResourceId,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Put an item into an item set
    Link {
        item_id: ResourceId,
        item_set_id: ResourceId,
    },
    /// Register a media of an item
    Media {
        id: ResourceId,
        #[arg(long)]
        item: ResourceId,
        /// File name of the media's renditions
        #[arg(long)]
        storage_id: String,
        #[arg(long, default_value = "image/jpeg")]
        media_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    let _guard = init_logging_with(&logging)?;

    debug!("Watermark CLI v{} starting", version());

    match cli.command {
        Commands::Info => {
            println!("Watermark v{}", version());
            println!("\nConfiguration:");
            println!("  Database: {}", config.database.database_url);
            println!("  Files root: {}", config.storage.files_root.display());
            println!("  Derivatives: {}", config.storage.derivatives.join(", "));
            println!(
                "  Watermarking: {}",
                if config.watermarking.enabled { "enabled" } else { "disabled" }
            );
            println!("  Apply on upload: {}", config.watermarking.apply_on_upload);
            println!("  Apply on import: {}", config.watermarking.apply_on_import);
            let types: Vec<_> = config.watermarking.supported_types.iter().cloned().collect();
            println!("  Supported types: {}", types.join(", "));
        }

        Commands::Composite {
            input,
            output,
            watermark,
            position,
            opacity,
        } => {
            info!("Compositing {} onto {}", watermark.display(), input.display());
            let base_bytes = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let watermark_bytes = std::fs::read(&watermark)
                .with_context(|| format!("Failed to read {}", watermark.display()))?;

            let base = codec::decode(&base_bytes)?;
            let overlay = codec::decode(&watermark_bytes)?;
            let composited =
                Compositor::new().composite(&base.image, &overlay.image, position, opacity)?;
            let encoded = codec::encode(&composited, base.format)?;

            std::fs::write(&output, encoded)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {} ({})", output.display(), base.format.mime_type());
        }

        command => {
            let db = Arc::new(DatabaseManager::new(&config.database).await?);
            let result = run_with_database(command, &config, db.clone(), cli.json).await;
            db.close().await;
            result?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let mut config = manager.config().clone();

    if let Some(database) = &cli.database {
        config.database.database_url = if database.starts_with("sqlite:") {
            database.clone()
        } else {
            format!("sqlite:{}", database)
        };
    }
    if let Some(files) = &cli.files {
        config.storage.files_root = files.clone();
    }

    Ok(config)
}

async fn run_with_database(
    command: Commands,
    config: &AppConfig,
    db: Arc<DatabaseManager>,
    json: bool,
) -> Result<()> {
    let applicator = WatermarkApplicator::from_config(config, db.clone());
    let resolver = applicator.resolver();

    match command {
        Commands::Resolve { resource_type, id } => {
            let resource = ResourceRef::new(resource_type, id);
            let resolution = resolver.resolve_with_source(resource).await?;
            if json {
                print_json(&resolution)?;
            } else {
                let origin = match resolution.source {
                    ResolutionSource::Direct => "assigned directly".to_string(),
                    ResolutionSource::Inherited { from } => format!("inherited from {}", from),
                    ResolutionSource::Default => "default set".to_string(),
                    ResolutionSource::ExplicitNone => "watermarking disabled".to_string(),
                    ResolutionSource::Unassigned => "nothing assigned".to_string(),
                };
                match &resolution.set {
                    Some(set) => println!("{}: '{}' (#{}, {})", resource, set.name, set.id, origin),
                    None => println!("{}: no watermark ({})", resource, origin),
                }
            }
        }

        Commands::Assign {
            resource_type,
            id,
            target,
        } => {
            let resource = ResourceRef::new(resource_type, id);
            let row = resolver.set_assignment(resource, target).await?;
            if json {
                print_json(&row)?;
            } else {
                match target {
                    AssignmentTarget::Set(set_id) => {
                        println!("Assigned watermark set #{} to {}", set_id, resource)
                    }
                    AssignmentTarget::NoWatermark => println!("Disabled watermarking for {}", resource),
                    AssignmentTarget::Default => println!("{} now inherits its watermark", resource),
                }
            }
        }

        Commands::Set(command) => run_set_command(command, db.as_ref(), json).await?,

        Commands::Setting(command) => match command {
            SettingCommand::Add { set_id, args } => {
                let image_ref = match args.image {
                    Some(image_ref) => image_ref,
                    None => bail!("--image is required when adding a setting"),
                };
                let setting = db
                    .add_setting(
                        set_id,
                        &NewWatermarkSetting {
                            orientation_type: args.orientation_type.unwrap_or(OrientationType::All),
                            position: args.position.unwrap_or_default(),
                            opacity: args.opacity.unwrap_or(1.0),
                            image_ref,
                        },
                    )
                    .await?;
                if json {
                    print_json(&setting)?;
                } else {
                    println!("Added setting #{} to watermark set #{}", setting.id, set_id);
                }
            }
            SettingCommand::Update { id, args } => {
                let setting = db
                    .update_setting(
                        id,
                        &WatermarkSettingUpdate {
                            orientation_type: args.orientation_type,
                            position: args.position,
                            opacity: args.opacity,
                            image_ref: args.image,
                        },
                    )
                    .await?;
                if json {
                    print_json(&setting)?;
                } else {
                    println!("Updated setting #{}", setting.id);
                }
            }
            SettingCommand::Delete { id } => {
                if !db.delete_setting(id).await? {
                    bail!("Watermark setting #{} does not exist", id);
                }
                println!("Deleted setting #{}", id);
            }
        },

        Commands::Catalog(command) => match command {
            CatalogCommand::ItemSet { id, title } => {
                db.register_item_set(id, &title).await?;
                println!("Registered item set #{}", id);
            }
            CatalogCommand::Item { id, title } => {
                db.register_item(id, &title).await?;
                println!("Registered item #{}", id);
            }
            CatalogCommand::Link {
                item_id,
                item_set_id,
            } => {
                db.link_item_to_set(item_id, item_set_id).await?;
                println!("Linked item #{} to item set #{}", item_id, item_set_id);
            }
            CatalogCommand::Media {
                id,
                item,
                storage_id,
                media_type,
            } => {
                db.register_media(id, item, &storage_id, &media_type).await?;
                println!("Registered media #{} of item #{}", id, item);
            }
        },

        Commands::Apply {
            media,
            item,
            all,
            trigger,
        } => {
            let media_ids = if all || item.is_some() {
                db.list_media_ids(item).await?
            } else if media.is_empty() {
                bail!("Nothing to do: pass --media, --item or --all");
            } else {
                media
            };

            info!("Applying watermarks to {} media", media_ids.len());
            let summary = applicator.apply_batch(&media_ids, trigger).await?;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "Processed {} media: {} derivatives watermarked, {} skipped, {} failed",
                    summary.processed, summary.watermarked, summary.skipped, summary.failed
                );
                for failure in &summary.failures {
                    match &failure.derivative {
                        Some(derivative) => println!(
                            "  media #{} ({}): {}",
                            failure.media_id, derivative, failure.message
                        ),
                        None => println!("  media #{}: {}", failure.media_id, failure.message),
                    }
                }
            }
        }

        Commands::Info | Commands::Composite { .. } => {
            bail!("command does not use the database")
        }
    }

    Ok(())
}

async fn run_set_command(command: SetCommand, db: &DatabaseManager, json: bool) -> Result<()> {
    match command {
        SetCommand::Create {
            name,
            default,
            disabled,
        } => {
            let set = db
                .create_set(&NewWatermarkSet {
                    name,
                    is_default: default,
                    enabled: !disabled,
                })
                .await?;
            if json {
                print_json(&set)?;
            } else {
                println!("Created watermark set #{} '{}'", set.id, set.name);
            }
        }
        SetCommand::List => {
            let sets = db.list_sets().await?;
            if json {
                print_json(&sets)?;
            } else if sets.is_empty() {
                println!("No watermark sets");
            } else {
                for set in &sets {
                    print_set_line(set);
                }
            }
        }
        SetCommand::Show { id } => {
            let Some(set) = db.get_set(id).await? else {
                bail!("Watermark set #{} does not exist", id);
            };
            if json {
                print_json(&set)?;
            } else {
                print_set_line(&set);
                for setting in &set.settings {
                    println!(
                        "  setting #{}: {} {} opacity={} image={}",
                        setting.id,
                        setting.orientation_type.as_str(),
                        setting.position,
                        setting.opacity,
                        setting.image_ref
                    );
                }
            }
        }
        SetCommand::Update { id, name, enabled } => {
            let set = db
                .update_set(
                    id,
                    &WatermarkSetUpdate {
                        name,
                        enabled,
                        is_default: None,
                    },
                )
                .await?;
            if json {
                print_json(&set)?;
            } else {
                print_set_line(&set);
            }
        }
        SetCommand::Default { id } => {
            let set = db.set_default(id).await?;
            if json {
                print_json(&set)?;
            } else {
                println!("Watermark set #{} '{}' is now the default", set.id, set.name);
            }
        }
        SetCommand::Delete { id } => {
            if !db.delete_set(id).await? {
                bail!("Watermark set #{} does not exist", id);
            }
            println!("Deleted watermark set #{}", id);
        }
    }

    Ok(())
}

fn print_set_line(set: &WatermarkSet) {
    let mut flags = Vec::new();
    if set.is_default {
        flags.push("default");
    }
    if !set.enabled {
        flags.push("disabled");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };
    println!(
        "#{} {}{} ({} settings)",
        set.id,
        set.name,
        flags,
        set.settings.len()
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
