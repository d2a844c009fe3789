pub mod daemon;

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use loopcast_core::catalog::{clear_cache_dir, scan_cache_dir};
use loopcast_core::{
    load_loopcast_config, ChannelSettings, LoopcastConfig, SettingsStore, StatusReport,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] loopcast_core::ConfigError),
    #[error("settings error: {0}")]
    Settings(#[from] loopcast_core::SettingsError),
    #[error("catalog error: {0}")]
    Catalog(#[from] loopcast_core::CatalogError),
    #[error("status error: {0}")]
    Status(#[from] loopcast_core::StatusError),
    #[error("broadcaster error: {0}")]
    Broadcaster(#[from] loopcast_core::BroadcasterError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Loopcast channel control interface", long_about = None)]
pub struct Cli {
    /// Path to loopcast.toml
    #[arg(long, default_value = "configs/loopcast.toml")]
    pub config: PathBuf,
    /// Token for local authentication (checked when LOOPCASTCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the channel daemon in the foreground
    Run,
    /// Shows what the channel is playing
    Status,
    /// Manages on-demand catalog sources
    #[command(subcommand)]
    Sources(SourcesCommands),
    /// Manages the live channel
    #[command(subcommand)]
    Live(LiveCommands),
    /// Shows or edits channel settings
    #[command(subcommand)]
    Settings(SettingsCommands),
    /// Inspects the on-demand media cache
    #[command(subcommand)]
    Cache(CacheCommands),
    /// Runs environment checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum SourcesCommands {
    List,
    /// Adds a channel handle, id or URL
    Add { source: String },
    Remove { source: String },
}

#[derive(Subcommand, Debug)]
pub enum LiveCommands {
    /// Sets the live channel probed every tick
    Set { channel: String },
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    Show,
    Set(SettingsSetArgs),
}

#[derive(Args, Debug, Default)]
pub struct SettingsSetArgs {
    #[arg(long)]
    pub display_name: Option<String>,
    #[arg(long)]
    pub logo: Option<String>,
    /// Re-encode on-demand items with the quality parameters
    #[arg(long)]
    pub transcode_on_demand: Option<bool>,
    #[arg(long)]
    pub video_codec: Option<String>,
    #[arg(long)]
    pub preset: Option<String>,
    #[arg(long)]
    pub crf: Option<u8>,
    #[arg(long)]
    pub audio_codec: Option<String>,
    #[arg(long)]
    pub audio_bitrate: Option<String>,
    #[arg(long)]
    pub max_height: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    List,
    /// Deletes every cached file
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Runs basic checks
    Check,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "loopcastctl", &mut io::stdout());
        return Ok(());
    }
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run => {
            daemon::init_tracing();
            daemon::run_daemon(context.config.clone())?;
        }
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Sources(command) => {
            let sources = context.sources(command)?;
            render(&sources, cli.format)?;
        }
        Commands::Live(command) => {
            let settings = context.live(command)?;
            render(&SettingsView(settings), cli.format)?;
        }
        Commands::Settings(SettingsCommands::Show) => {
            let settings = context.store.load()?;
            render(&SettingsView(settings), cli.format)?;
        }
        Commands::Settings(SettingsCommands::Set(args)) => {
            let settings = context.settings_set(args)?;
            render(&SettingsView(settings), cli.format)?;
        }
        Commands::Cache(CacheCommands::List) => {
            let cache = context.cache_list()?;
            render(&cache, cli.format)?;
        }
        Commands::Cache(CacheCommands::Clear) => {
            let removed = clear_cache_dir(&context.config.cache_dir())?;
            render(&CacheCleared { removed }, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = env::var("LOOPCASTCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config_path: PathBuf,
    config: LoopcastConfig,
    store: SettingsStore,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_loopcast_config(&cli.config)?;
        let store = SettingsStore::new(config.settings_path());
        Ok(Self {
            config_path: cli.config.clone(),
            config,
            store,
        })
    }

    fn gather_status(&self) -> Result<StatusView> {
        let path = self.config.status_path();
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "{} (is the daemon running?)",
                path.display()
            )));
        }
        let report = StatusReport::read_from(&path)?;
        let stale = report.age_seconds(Utc::now())
            > (self.config.arbitration.interval_seconds * 2) as i64;
        Ok(StatusView { report, stale })
    }

    fn sources(&self, command: &SourcesCommands) -> Result<SourceList> {
        let settings = match command {
            SourcesCommands::List => self.store.load()?,
            SourcesCommands::Add { source } => {
                if source.trim().is_empty() {
                    return Err(AppError::InvalidArgument("source is empty".into()));
                }
                self.store.update(|settings| {
                    settings.add_source(source);
                    settings.clone()
                })?
            }
            SourcesCommands::Remove { source } => {
                let (removed, settings) = self.store.update(|settings| {
                    (settings.remove_source(source), settings.clone())
                })?;
                if !removed {
                    return Err(AppError::InvalidArgument(format!(
                        "source {source} is not configured"
                    )));
                }
                settings
            }
        };
        Ok(SourceList {
            sources: settings.on_demand_sources,
        })
    }

    fn live(&self, command: &LiveCommands) -> Result<ChannelSettings> {
        let channel = match command {
            LiveCommands::Set { channel } => {
                let channel = channel.trim();
                if channel.is_empty() {
                    return Err(AppError::InvalidArgument("channel is empty".into()));
                }
                Some(channel.to_string())
            }
            LiveCommands::Clear => None,
        };
        Ok(self.store.update(|settings| {
            settings.live_channel = channel;
            settings.clone()
        })?)
    }

    fn settings_set(&self, args: &SettingsSetArgs) -> Result<ChannelSettings> {
        Ok(self.store.update(|settings| {
            if let Some(name) = &args.display_name {
                settings.display_name = name.clone();
            }
            if let Some(logo) = &args.logo {
                settings.logo = (!logo.is_empty()).then(|| logo.clone());
            }
            if let Some(flag) = args.transcode_on_demand {
                settings.transcode_on_demand = flag;
            }
            let quality = &mut settings.quality_params;
            if let Some(codec) = &args.video_codec {
                quality.video_codec = codec.clone();
            }
            if let Some(preset) = &args.preset {
                quality.preset = preset.clone();
            }
            if let Some(crf) = args.crf {
                quality.crf = crf;
            }
            if let Some(codec) = &args.audio_codec {
                quality.audio_codec = codec.clone();
            }
            if let Some(bitrate) = &args.audio_bitrate {
                quality.audio_bitrate = bitrate.clone();
            }
            if let Some(height) = args.max_height {
                quality.max_height = (height > 0).then_some(height);
            }
            settings.clone()
        })?)
    }

    fn cache_list(&self) -> Result<CacheList> {
        let items = scan_cache_dir(&self.config.cache_dir())?;
        let rows = items
            .into_values()
            .map(|item| {
                let size_bytes = fs::metadata(&item.local_path).map(|m| m.len()).unwrap_or(0);
                CacheEntry {
                    id: item.id,
                    title: item.title,
                    duration_seconds: item.duration_seconds,
                    source: item.source,
                    size_bytes,
                }
            })
            .collect();
        Ok(CacheList { rows })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("loopcast.toml", &self.config_path));
        results.push(self.check_tool("ffmpeg", &self.config.tools.ffmpeg));
        results.push(self.check_tool("streamlink", &self.config.tools.streamlink));
        results.push(self.check_tool("yt-dlp", &self.config.tools.yt_dlp));
        results.push(self.check_settings());
        results.push(self.check_directory("cache", &self.config.cache_dir()));
        results.push(self.check_directory("hls", &self.config.hls_dir()));
        results.push(self.check_conduit(&self.config.conduit_path()));
        results.push(self.check_output(&self.config.segmenter_output()));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_tool(&self, name: &str, program: &str) -> HealthEntry {
        match find_executable(program) {
            Some(path) => HealthEntry::ok(name, format!("{}", path.display())),
            None => HealthEntry::error(name, format!("{program} not found on PATH")),
        }
    }

    fn check_settings(&self) -> HealthEntry {
        let path = self.store.path();
        if !path.exists() {
            return HealthEntry::warn("settings", format!("{} absent, using defaults", path.display()));
        }
        match self.store.load() {
            Ok(_) => HealthEntry::ok("settings", format!("{}", path.display())),
            Err(error) => HealthEntry::error("settings", error.to_string()),
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_conduit(&self, path: &Path) -> HealthEntry {
        match fs::symlink_metadata(path) {
            Ok(meta) if is_fifo(&meta) => HealthEntry::ok("conduit", format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                "conduit",
                format!("{path} is not a named pipe", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                "conduit",
                format!("{path} not created yet", path = path.display()),
            ),
        }
    }

    fn check_output(&self, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => {
                let age = meta
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from)
                    .map(|modified| (Utc::now() - modified).num_seconds());
                match age {
                    Some(seconds) if seconds > 60 => HealthEntry::warn(
                        "hls output",
                        format!("{} not updated for {seconds}s", path.display()),
                    ),
                    _ => HealthEntry::ok("hls output", format!("{}", path.display())),
                }
            }
            _ => HealthEntry::warn(
                "hls output",
                format!("{path} not produced yet", path = path.display()),
            ),
        }
    }
}

fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

#[cfg(unix)]
fn is_fifo(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &fs::Metadata) -> bool {
    false
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    #[serde(flatten)]
    pub report: StatusReport,
    pub stale: bool,
}

impl DisplayFallback for StatusView {
    fn display(&self) -> String {
        let report = &self.report;
        let mut lines = vec![format!(
            "Source: {}",
            report
                .active_source_kind
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "none".to_string())
        )];
        lines.push(format!(
            "Program: {}",
            report.program.as_deref().unwrap_or("-")
        ));
        if let Some(since) = report.since {
            lines.push(format!("Since: {}", since.to_rfc3339()));
        }
        let pid = |pid: Option<u32>| pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        lines.push(format!("Feeder pid: {}", pid(report.feeder_pid)));
        lines.push(format!(
            "Segmenter pid: {} (restarts: {})",
            pid(report.segmenter_pid),
            report.segmenter_restarts
        ));
        lines.push(format!(
            "Catalog: {} items (generation {})",
            report.catalog_items, report.catalog_generation
        ));
        let mut updated = format!("Updated: {}", report.updated_at.to_rfc3339());
        if self.stale {
            updated.push_str(" (stale)");
        }
        lines.push(updated);
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SourceList {
    pub sources: Vec<String>,
}

impl DisplayFallback for SourceList {
    fn display(&self) -> String {
        if self.sources.is_empty() {
            return "No sources configured".to_string();
        }
        self.sources
            .iter()
            .map(|source| format!("- {source}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct SettingsView(pub ChannelSettings);

impl DisplayFallback for SettingsView {
    fn display(&self) -> String {
        let settings = &self.0;
        let quality = &settings.quality_params;
        let mut lines = vec![
            format!("Display name: {}", settings.display_name),
            format!("Live channel: {}", settings.live_channel().unwrap_or("-")),
            format!("Logo: {}", settings.logo.as_deref().unwrap_or("-")),
            format!("On-demand sources: {}", settings.on_demand_sources.len()),
            format!("Transcode on demand: {}", settings.transcode_on_demand),
        ];
        lines.push(format!(
            "Quality: {} preset={} crf={} audio={}@{} max_height={}",
            quality.video_codec,
            quality.preset,
            quality.crf,
            quality.audio_codec,
            quality.audio_bitrate,
            quality
                .max_height
                .map(|h| h.to_string())
                .unwrap_or_else(|| "-".into())
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CacheList {
    pub rows: Vec<CacheEntry>,
}

#[derive(Debug, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub source: Option<String>,
    pub size_bytes: u64,
}

impl DisplayFallback for CacheList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Cache empty".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{id} | {title} | {duration}s | {mb:.1} MiB | {source}",
                id = entry.id,
                title = entry.title,
                duration = entry.duration_seconds,
                mb = entry.size_bytes as f64 / (1024.0 * 1024.0),
                source = entry.source.as_deref().unwrap_or("-"),
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CacheCleared {
    pub removed: usize,
}

impl DisplayFallback for CacheCleared {
    fn display(&self) -> String {
        format!("Removed {} cached files", self.removed)
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(entry.display());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
