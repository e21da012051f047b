use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use codec::{ExportFormat, ImportMode};
use manager::{EditRequest, NewWebapp, Notice, SearchQuery, Severity, SortKey, WebappManager};
use preview::{BrowserShot, HtmlRenderer, NullRenderer};
use registry::{Artifact, FileStore};

#[derive(Parser)]
#[command(name = "webshelf")]
#[command(about = "Webshelf - local registry for self-contained HTML webapps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an HTML file as a new webapp
    Add {
        /// HTML file to register
        file: PathBuf,

        /// Display name (defaults to the file stem)
        #[arg(short, long)]
        name: Option<String>,

        /// Free-form description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Category (productivity, games, utilities, entertainment, other)
        #[arg(short, long, default_value = "other")]
        category: String,

        /// Comma-separated tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// PNG to use as the preview instead of generating one
        #[arg(long)]
        screenshot: Option<PathBuf>,
    },

    /// List registered webapps
    List {
        /// Substring match on name, description, or tags
        #[arg(long)]
        search: Option<String>,

        /// Only show one category
        #[arg(long)]
        category: Option<String>,

        /// Sort order (date-added, name, last-used)
        #[arg(long, default_value = "date-added")]
        sort: String,
    },

    /// Show one webapp in full
    Show {
        id: String,
    },

    /// Update a webapp's metadata, source file, or preview
    Edit {
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long)]
        category: Option<String>,

        /// Comma-separated tags (replaces the current set)
        #[arg(short, long, value_delimiter = ',')]
        tags: Option<Vec<String>>,

        /// Replace the source with a new HTML file
        #[arg(long)]
        file: Option<PathBuf>,

        /// PNG to use as the preview instead of generating one
        #[arg(long)]
        screenshot: Option<PathBuf>,
    },

    /// Delete a webapp
    Remove {
        id: String,
    },

    /// Open a webapp in the default browser
    Launch {
        id: String,
    },

    /// Export the whole registry to a file
    Export {
        /// Output path (defaults to webshelf-export-<date>.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Export format (json, xml)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Import a previous export
    Import {
        /// Export file (.json or .xml)
        input: PathBuf,

        /// Reconciliation mode (merge, replace)
        #[arg(long, default_value = "merge")]
        mode: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let (manager, notices) = open_manager()?;
    forward_notices(notices);

    match cli.command {
        Commands::Add {
            file,
            name,
            description,
            category,
            tags,
            screenshot,
        } => add_command(&manager, file, name, description, category, tags, screenshot).await,
        Commands::List {
            search,
            category,
            sort,
        } => list_command(&manager, search, category, &sort),
        Commands::Show { id } => show_command(&manager, &id),
        Commands::Edit {
            id,
            name,
            description,
            category,
            tags,
            file,
            screenshot,
        } => {
            edit_command(
                &manager, &id, name, description, category, tags, file, screenshot,
            )
            .await
        }
        Commands::Remove { id } => {
            manager.remove(&id)?;
            Ok(())
        }
        Commands::Launch { id } => launch_command(&manager, &id),
        Commands::Export { output, format } => export_command(&manager, output, &format),
        Commands::Import { input, mode } => import_command(&manager, input, &mode),
    }
}

fn open_manager() -> Result<(
    WebappManager,
    tokio::sync::mpsc::UnboundedReceiver<Notice>,
)> {
    let store = Arc::new(FileStore::open_default()?);
    let renderer: Arc<dyn HtmlRenderer> = match BrowserShot::detect() {
        Ok(shot) => Arc::new(shot),
        Err(err) => {
            warn!(%err, "previews will fall back to text excerpts");
            Arc::new(NullRenderer)
        }
    };
    let (manager, notices) = WebappManager::open(store, renderer)?;
    Ok((manager, notices))
}

fn forward_notices(mut notices: tokio::sync::mpsc::UnboundedReceiver<Notice>) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice.severity {
                Severity::Error => error!("{}", notice.message),
                Severity::Info | Severity::Success => info!("{}", notice.message),
            }
        }
    });
}

async fn add_command(
    manager: &WebappManager,
    file: PathBuf,
    name: Option<String>,
    description: String,
    category: String,
    tags: Vec<String>,
    screenshot: Option<PathBuf>,
) -> Result<()> {
    let file_content = std::fs::read_to_string(&file)
        .with_context(|| format!("read HTML file {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let custom_screenshot = read_custom_screenshot(screenshot)?;
    let generated = custom_screenshot.is_none();

    let id = manager.add(NewWebapp {
        name,
        description,
        category,
        tags,
        file_name,
        file_content,
        custom_screenshot,
    })?;

    if generated {
        wait_for_preview(manager, &id).await;
    }
    println!("{id}");
    Ok(())
}

fn list_command(
    manager: &WebappManager,
    search: Option<String>,
    category: Option<String>,
    sort: &str,
) -> Result<()> {
    let query = SearchQuery {
        text: search,
        category,
        sort: parse_sort(sort)?,
    };
    let hits = manager.search(&query);
    if hits.is_empty() {
        println!("no webapps");
        return Ok(());
    }
    for app in hits {
        println!(
            "{}  {:<24}  [{}]  uses: {}  preview: {}",
            app.id,
            app.name,
            app.category,
            app.usage_count,
            artifact_kind(&app.screenshot),
        );
    }
    Ok(())
}

fn show_command(manager: &WebappManager, id: &str) -> Result<()> {
    let app = manager
        .get(id)
        .ok_or_else(|| anyhow!("webapp not found: {id}"))?;
    println!("id:            {}", app.id);
    println!("name:          {}", app.name);
    println!("description:   {}", app.description);
    println!("category:      {}", app.category);
    println!("tags:          {}", app.tags.join(", "));
    println!("file:          {}", app.file_name);
    println!("added:         {}", app.date_added);
    println!("modified:      {}", app.last_modified);
    match app.last_used {
        Some(used) => println!("last used:     {used}"),
        None => println!("last used:     never"),
    }
    println!("uses:          {}", app.usage_count);
    match &app.screenshot {
        Artifact::Pending => println!("preview:       pending"),
        Artifact::Image { title, url } => {
            println!("preview:       image \"{title}\" ({} bytes)", url.len())
        }
        Artifact::Text { title, preview } => {
            println!("preview:       text \"{title}\"");
            println!("{preview}");
        }
    }
    Ok(())
}

async fn edit_command(
    manager: &WebappManager,
    id: &str,
    name: Option<String>,
    description: Option<String>,
    category: Option<String>,
    tags: Option<Vec<String>>,
    file: Option<PathBuf>,
    screenshot: Option<PathBuf>,
) -> Result<()> {
    let current = manager
        .get(id)
        .ok_or_else(|| anyhow!("webapp not found: {id}"))?;

    let new_file = match file {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read HTML file {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some((file_name, content))
        }
        None => None,
    };
    let custom_screenshot = read_custom_screenshot(screenshot)?;
    let regenerates = new_file.is_some() && custom_screenshot.is_none();

    manager.edit(
        id,
        EditRequest {
            name: name.unwrap_or(current.name),
            description: description.unwrap_or(current.description),
            category: category.unwrap_or(current.category),
            tags: tags.unwrap_or(current.tags),
            new_file,
            custom_screenshot,
        },
    )?;

    if regenerates {
        wait_for_preview(manager, id).await;
    }
    Ok(())
}

fn launch_command(manager: &WebappManager, id: &str) -> Result<()> {
    let app = manager.launch(id)?;

    let launch_dir = registry::app_data_dir().join("launch");
    std::fs::create_dir_all(&launch_dir)?;
    let page = launch_dir.join(format!("{}.html", app.id));
    std::fs::write(&page, &app.file_content)?;

    webbrowser::open(&format!("file://{}", page.display()))
        .with_context(|| format!("open {}", page.display()))?;
    info!(name = %app.name, "launched");
    Ok(())
}

fn export_command(
    manager: &WebappManager,
    output: Option<PathBuf>,
    format: &str,
) -> Result<()> {
    let format = parse_format(format)?;
    let payload = manager.export_all(format)?;
    let path = output.unwrap_or_else(|| PathBuf::from(&payload.file_name));
    std::fs::write(&path, &payload.data)
        .with_context(|| format!("write export {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

fn import_command(manager: &WebappManager, input: PathBuf, mode: &str) -> Result<()> {
    // Reject unknown extensions before touching the file.
    let format = ExportFormat::from_path(&input)?;
    let mode = parse_mode(mode)?;
    let text = std::fs::read_to_string(&input)
        .with_context(|| format!("read import file {}", input.display()))?;
    let outcome = manager.import_all(&text, format, mode)?;
    println!(
        "imported {} webapps, skipped {}, registry now holds {}",
        outcome.imported, outcome.skipped, outcome.total
    );
    Ok(())
}

fn read_custom_screenshot(path: Option<PathBuf>) -> Result<Option<String>> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("read screenshot {}", path.display()))?;
            Ok(Some(preview::png_data_uri(&bytes)))
        }
        None => Ok(None),
    }
}

async fn wait_for_preview(manager: &WebappManager, id: &str) {
    info!("generating preview...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        match manager.get(id) {
            None => return,
            Some(app) if !app.screenshot.is_pending() => {
                info!(kind = artifact_kind(&app.screenshot), "preview ready");
                return;
            }
            Some(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("preview still pending; it will retry on the next edit");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn artifact_kind(artifact: &Artifact) -> &'static str {
    match artifact {
        Artifact::Pending => "pending",
        Artifact::Image { .. } => "image",
        Artifact::Text { .. } => "text",
    }
}

fn parse_format(value: &str) -> Result<ExportFormat> {
    match value.to_ascii_lowercase().as_str() {
        "json" => Ok(ExportFormat::Json),
        "xml" => Ok(ExportFormat::Xml),
        other => Err(anyhow!("unknown format {other:?} (expected json or xml)")),
    }
}

fn parse_mode(value: &str) -> Result<ImportMode> {
    match value.to_ascii_lowercase().as_str() {
        "merge" => Ok(ImportMode::Merge),
        "replace" => Ok(ImportMode::Replace),
        other => Err(anyhow!("unknown mode {other:?} (expected merge or replace)")),
    }
}

fn parse_sort(value: &str) -> Result<SortKey> {
    match value.to_ascii_lowercase().as_str() {
        "date-added" => Ok(SortKey::DateAdded),
        "name" => Ok(SortKey::Name),
        "last-used" => Ok(SortKey::LastUsed),
        other => Err(anyhow!(
            "unknown sort {other:?} (expected date-added, name, or last-used)"
        )),
    }
}
