use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One cached on-demand unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub local_path: PathBuf,
    pub duration_seconds: u64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// What the channel should be showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Live(String),
    OnDemand(FeedItem),
    TestPattern,
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Live(_) => SourceKind::Live,
            Source::OnDemand(_) => SourceKind::OnDemand,
            Source::TestPattern => SourceKind::TestPattern,
        }
    }

    /// Whether `other` can keep playing in place of `self` without a transition.
    ///
    /// On-demand rotation only advances when the current item ends, so any
    /// on-demand feeder satisfies an on-demand decision.
    pub fn satisfied_by(&self, other: &Source) -> bool {
        match (self, other) {
            (Source::Live(wanted), Source::Live(active)) => wanted == active,
            (Source::OnDemand(_), Source::OnDemand(_)) => true,
            (Source::TestPattern, Source::TestPattern) => true,
            _ => false,
        }
    }

    /// EPG-visible program label.
    pub fn program_label(&self) -> String {
        match self {
            Source::Live(channel) => format!("Live: {channel}"),
            Source::OnDemand(item) => format!("On Demand: {}", item.title),
            Source::TestPattern => "Off Air".to_string(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Live(channel) => write!(f, "live({channel})"),
            Source::OnDemand(item) => write!(f, "on_demand({})", item.id),
            Source::TestPattern => write!(f, "test_pattern"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Live,
    OnDemand,
    TestPattern,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Live => "live",
            SourceKind::OnDemand => "on_demand",
            SourceKind::TestPattern => "test_pattern",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
