pub mod broadcaster;
pub mod catalog;
pub mod conduit;
pub mod config;
pub mod error;
pub mod guide;
pub mod live;
pub mod process;
pub mod settings;
pub mod source;
pub mod status;

pub use broadcaster::{
    ActiveFeeder, Broadcaster, BroadcasterError, CurrentProgram, FeederController, FeederError,
    FfmpegCommands, PlaybackCursor, SegmenterError, SegmenterSupervisor, SourceResolver,
    TickReport, TransitionOutcome, Wake,
};
pub use catalog::{
    CatalogCache, CatalogError, CatalogFetcher, CatalogRefresher, CatalogSnapshot, RefreshReport,
    YtDlpFetcher,
};
pub use conduit::{Conduit, ConduitError};
pub use config::{load_loopcast_config, FillerPolicy, LoopcastConfig};
pub use error::{ConfigError, Result};
pub use guide::{GuideError, ProgramGuide};
pub use live::{LiveProbe, ProbeFailure, StreamlinkProbe};
pub use process::{
    CommandExecutor, CommandSpec, ProcessError, ProcessHandle, ProcessLauncher,
    SystemCommandExecutor, SystemLauncher,
};
pub use settings::{ChannelSettings, QualityParams, SettingsError, SettingsStore};
pub use source::{FeedItem, Source, SourceKind};
pub use status::{StatusError, StatusReport};
