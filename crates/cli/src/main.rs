use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use project::{app_data_dir, import_media, ProjectDb};
use session::{
    MediaGenerator, MediaVault, ProjectStore, RenderResolution, ThumbSize, TimelineSession,
};
use timeline::{AssetKind, Layer, Ms};

#[derive(Parser)]
#[command(name = "strata-cli")]
#[command(about = "Strata timeline editor - headless project operations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a media file and print its metadata
    Probe {
        file: PathBuf,
    },

    /// Import media files into a project's timeline
    Import {
        /// Project name
        #[arg(short, long)]
        project: String,

        /// Media files to import
        files: Vec<PathBuf>,
    },

    /// Add a text overlay at the end of the timeline
    Text {
        #[arg(short, long)]
        project: String,

        title: String,
    },

    /// Print the project's layers and assets
    Show {
        #[arg(short, long)]
        project: String,
    },

    /// Render the timeline to a single output file
    Export {
        #[arg(short, long)]
        project: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// 720p, 1080p or 2160p
        #[arg(long, default_value = "1080p")]
        resolution: String,
    },
}

struct DbStore {
    db: ProjectDb,
    project_id: String,
}

impl ProjectStore for DbStore {
    fn save_layers(&mut self, layers: &[Layer]) -> Result<()> {
        let json = serde_json::to_string(layers)?;
        self.db.save_timeline(&self.project_id, &json)?;
        Ok(())
    }

    fn load_layers(&mut self) -> Result<Vec<Layer>> {
        match self.db.load_timeline(&self.project_id)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

struct FfmpegGenerator {
    thumb_dir: PathBuf,
}

impl MediaGenerator for FfmpegGenerator {
    fn probe_duration_ms(&self, src: &Path) -> Result<Ms> {
        Ok(media_io::probe_duration_ms(src)?)
    }

    fn thumbnail(&self, src: &Path, cut_from: Ms, size: ThumbSize) -> Result<PathBuf> {
        let (width, height) = match size {
            ThumbSize::Mini => (160, 90),
            ThumbSize::Medium => (480, 270),
        };
        fs::create_dir_all(&self.thumb_dir)?;
        let mut hasher = DefaultHasher::new();
        src.hash(&mut hasher);
        let out = self
            .thumb_dir
            .join(format!("{:016x}-{cut_from}-{width}x{height}.jpg", hasher.finish()));
        media_io::generate_thumbnail(src, &out, cut_from, width, height)?;
        Ok(out)
    }

    fn export(
        &self,
        layers: &[Layer],
        resolution: RenderResolution,
        out: &Path,
    ) -> Result<PathBuf> {
        let (width, height) = resolution.dimensions();
        media_io::render_timeline(layers, width, height, out)?;
        Ok(out.to_path_buf())
    }
}

struct Vault;

impl MediaVault for Vault {
    fn import(&self, src: &Path, kind: AssetKind) -> Result<PathBuf> {
        import_media(src, kind)
    }
}

fn open_session(project: &str) -> Result<TimelineSession> {
    let db = ProjectDb::open_or_create(&app_data_dir().join("projects.db"))?;
    db.ensure_project(project, project)?;
    let store = DbStore {
        db,
        project_id: project.to_string(),
    };
    let generator = FfmpegGenerator {
        thumb_dir: app_data_dir().join("thumbnails"),
    };
    Ok(TimelineSession::open(
        Box::new(store),
        Box::new(generator),
        Box::new(Vault),
    )?)
}

fn parse_resolution(s: &str) -> Result<RenderResolution> {
    match s {
        "720p" => Ok(RenderResolution::Hd720),
        "1080p" => Ok(RenderResolution::FullHd1080),
        "2160p" => Ok(RenderResolution::Uhd2160),
        other => bail!("unknown resolution {other}; expected 720p, 1080p or 2160p"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Probe { file } => {
            let info = media_io::probe_media(&file)?;
            println!("kind:     {:?}", info.kind);
            match info.duration_ms {
                Some(ms) => println!("duration: {ms} ms"),
                None => println!("duration: unbounded"),
            }
            if let (Some(w), Some(h)) = (info.width, info.height) {
                println!("size:     {w}x{h}");
            }
        }
        Commands::Import { project, files } => {
            let mut session = open_session(&project)?;
            for file in files {
                let kind = match media_io::probe_media(&file) {
                    Ok(info) => info.kind,
                    Err(e) => {
                        warn!(path = %file.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                let layer = match kind {
                    AssetKind::Audio => 2,
                    _ => 0,
                };
                session.add_asset(layer, kind, &file)?;
                info!(path = %file.display(), ?kind, "imported");
            }
            session.dispose();
        }
        Commands::Text { project, title } => {
            let mut session = open_session(&project)?;
            session.add_text(&title)?;
            session.dispose();
        }
        Commands::Show { project } => {
            let session = open_session(&project)?;
            let timeline = session.timeline();
            println!("duration: {} ms", timeline.duration());
            for (i, layer) in timeline.layers.iter().enumerate() {
                println!("layer {i} ({:?}, volume {:.2})", layer.kind, layer.volume);
                for (j, asset) in layer.assets.iter().enumerate() {
                    let label = if asset.is_spacer() {
                        "<spacer>".to_string()
                    } else if asset.kind == AssetKind::Text {
                        format!("\"{}\"", asset.title)
                    } else {
                        asset.src_path.display().to_string()
                    };
                    let missing = if asset.missing { "  [missing]" } else { "" };
                    println!(
                        "  [{j}] {:?} {}..{} cut_from={} {label}{missing}",
                        asset.kind,
                        asset.begin,
                        asset.end(),
                        asset.cut_from,
                    );
                }
            }
        }
        Commands::Export {
            project,
            output,
            resolution,
        } => {
            let resolution = parse_resolution(&resolution)?;
            let mut session = open_session(&project)?;
            let out = session.export(resolution, &output)?;
            info!(path = %out.display(), "export finished");
            session.dispose();
        }
    }

    Ok(())
}
