use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

use crate::catalog::CatalogSnapshot;
use crate::live::LiveProbe;
use crate::settings::ChannelSettings;
use crate::source::{FeedItem, Source};

/// Shuffled rotation over the catalog.
///
/// The order is drawn once per pass; `commit` consumes the head. A new pass
/// starts when the order runs out or the snapshot generation changes.
#[derive(Debug)]
pub struct PlaybackCursor {
    rng: ChaCha20Rng,
    generation: Option<u64>,
    order: VecDeque<String>,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self::with_rng(ChaCha20Rng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(rng: ChaCha20Rng) -> Self {
        Self {
            rng,
            generation: None,
            order: VecDeque::new(),
        }
    }

    /// Next item of the current pass without consuming it.
    pub fn peek(&mut self, snapshot: &CatalogSnapshot) -> Option<FeedItem> {
        if snapshot.is_empty() {
            self.order.clear();
            self.generation = Some(snapshot.generation());
            return None;
        }
        if self.generation != Some(snapshot.generation()) {
            self.reshuffle(snapshot);
        }
        // Items evicted mid-pass are skipped.
        while let Some(id) = self.order.front() {
            if let Some(item) = snapshot.get(id) {
                return Some(item.clone());
            }
            self.order.pop_front();
        }
        self.reshuffle(snapshot);
        self.order.front().and_then(|id| snapshot.get(id)).cloned()
    }

    /// Consumes `item` if it heads the current pass.
    pub fn commit(&mut self, item: &FeedItem) -> bool {
        if self.order.front().map(|id| id == &item.id).unwrap_or(false) {
            self.order.pop_front();
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> usize {
        self.order.len()
    }

    fn reshuffle(&mut self, snapshot: &CatalogSnapshot) {
        let mut ids: Vec<String> = snapshot.items().keys().cloned().collect();
        ids.shuffle(&mut self.rng);
        debug!(
            generation = snapshot.generation(),
            items = ids.len(),
            "rotation reshuffled"
        );
        self.order = ids.into();
        self.generation = Some(snapshot.generation());
    }
}

impl Default for PlaybackCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides what the channel should be showing right now.
pub struct SourceResolver {
    probe: Arc<dyn LiveProbe>,
    cursor: PlaybackCursor,
}

impl fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceResolver")
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl SourceResolver {
    pub fn new(probe: Arc<dyn LiveProbe>, cursor: PlaybackCursor) -> Self {
        Self { probe, cursor }
    }

    /// Live beats on-demand beats the test pattern. Never advances the rotation.
    pub async fn resolve(&mut self, settings: &ChannelSettings, snapshot: &CatalogSnapshot) -> Source {
        if let Some(channel) = settings.live_channel() {
            match self.probe.resolve(channel).await {
                Ok(_) => return Source::Live(channel.to_string()),
                Err(failure) if failure.is_offline() => {
                    debug!(channel, "live channel offline");
                }
                Err(failure) => {
                    info!(channel, %failure, "live probe failed, treating as offline");
                }
            }
        }
        match self.cursor.peek(snapshot) {
            Some(item) => Source::OnDemand(item),
            None => Source::TestPattern,
        }
    }

    /// Records that `item` actually started playing.
    pub fn commit(&mut self, item: &FeedItem) {
        if !self.cursor.commit(item) {
            debug!(id = %item.id, "committed item was not at the head of the rotation");
        }
    }

    pub fn replace_cursor(&mut self, cursor: PlaybackCursor) {
        self.cursor = cursor;
    }

    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    use url::Url;

    use super::*;
    use crate::catalog::CatalogCache;
    use crate::live::ProbeFailure;
    use crate::source::tests::item;

    /// Probe whose answer the test flips at will.
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        live: Mutex<bool>,
        calls: Mutex<u32>,
    }

    impl FakeProbe {
        pub(crate) fn set_live(&self, live: bool) {
            *self.live.lock().unwrap() = live;
        }

        pub(crate) fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl LiveProbe for FakeProbe {
        async fn resolve(&self, channel: &str) -> Result<Url, ProbeFailure> {
            *self.calls.lock().unwrap() += 1;
            if *self.live.lock().unwrap() {
                Ok(Url::parse(&format!("https://video.example/{channel}.m3u8")).unwrap())
            } else {
                Err(ProbeFailure::Offline {
                    status: Some(1),
                    stderr: "No playable streams found".into(),
                })
            }
        }
    }

    pub(crate) fn catalog(ids: &[&str]) -> Arc<CatalogSnapshot> {
        let cache = CatalogCache::new();
        let items: BTreeMap<_, _> = ids
            .iter()
            .map(|id| (id.to_string(), item(id, 300)))
            .collect();
        cache.publish(items)
    }

    fn settings(live: Option<&str>) -> ChannelSettings {
        ChannelSettings {
            live_channel: live.map(str::to_string),
            ..ChannelSettings::default()
        }
    }

    fn resolver(probe: Arc<FakeProbe>) -> SourceResolver {
        SourceResolver::new(probe, PlaybackCursor::seeded(7))
    }

    #[tokio::test]
    async fn live_wins_when_probe_succeeds() {
        let probe = Arc::new(FakeProbe::default());
        probe.set_live(true);
        let mut resolver = resolver(Arc::clone(&probe));
        let source = resolver
            .resolve(&settings(Some("creator")), &catalog(&["a"]))
            .await;
        assert_eq!(source, Source::Live("creator".into()));
    }

    #[tokio::test]
    async fn offline_channel_falls_through_to_on_demand() {
        let probe = Arc::new(FakeProbe::default());
        let mut resolver = resolver(Arc::clone(&probe));
        let source = resolver
            .resolve(&settings(Some("creator")), &catalog(&["a"]))
            .await;
        assert_eq!(source.kind(), crate::source::SourceKind::OnDemand);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn empty_catalog_without_live_is_test_pattern() {
        let probe = Arc::new(FakeProbe::default());
        let mut resolver = resolver(Arc::clone(&probe));
        let source = resolver.resolve(&settings(None), &catalog(&[])).await;
        assert_eq!(source, Source::TestPattern);
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn resolve_does_not_advance_rotation() {
        let mut resolver = resolver(Arc::new(FakeProbe::default()));
        let snapshot = catalog(&["a", "b", "c"]);
        let first = resolver.resolve(&settings(None), &snapshot).await;
        let again = resolver.resolve(&settings(None), &snapshot).await;
        assert_eq!(first, again);
    }

    #[test]
    fn each_item_plays_once_per_pass() {
        let snapshot = catalog(&["a", "b", "c", "d", "e"]);
        let mut cursor = PlaybackCursor::seeded(42);
        for _ in 0..3 {
            let mut seen = HashSet::new();
            for _ in 0..5 {
                let item = cursor.peek(&snapshot).unwrap();
                assert!(cursor.commit(&item));
                assert!(seen.insert(item.id), "item repeated within a pass");
            }
            assert_eq!(seen.len(), 5);
            assert_eq!(cursor.remaining(), 0);
        }
    }

    #[test]
    fn two_items_alternate_across_passes() {
        let snapshot = catalog(&["a", "b"]);
        let mut cursor = PlaybackCursor::seeded(1);
        let first = cursor.peek(&snapshot).unwrap();
        cursor.commit(&first);
        let second = cursor.peek(&snapshot).unwrap();
        cursor.commit(&second);
        assert_ne!(first.id, second.id);
        // The next pass starts over with both items available.
        let third = cursor.peek(&snapshot).unwrap();
        assert!(third.id == "a" || third.id == "b");
        assert_eq!(cursor.remaining(), 2);
    }

    #[test]
    fn new_generation_reshuffles() {
        let mut cursor = PlaybackCursor::seeded(3);
        let old = catalog(&["a", "b", "c"]);
        let item = cursor.peek(&old).unwrap();
        cursor.commit(&item);
        assert_eq!(cursor.remaining(), 2);

        let cache = CatalogCache::new();
        cache.publish(old.items().clone());
        let mut grown = old.items().clone();
        grown.insert("d".into(), crate::source::tests::item("d", 300));
        let fresh = cache.publish(grown);
        assert_ne!(fresh.generation(), old.generation());
        cursor.peek(&fresh).unwrap();
        assert_eq!(cursor.remaining(), 4);
    }

    #[test]
    fn evicted_items_are_skipped() {
        let mut cursor = PlaybackCursor::seeded(9);
        let snapshot = catalog(&["a", "b"]);
        let head = cursor.peek(&snapshot).unwrap();
        let mut shrunk = BTreeMap::new();
        let other = if head.id == "a" { "b" } else { "a" };
        shrunk.insert(other.to_string(), item(other, 300));
        let cache = CatalogCache::new();
        // Same generation number as `snapshot` but without the head item.
        let replaced = cache.publish(shrunk);
        assert_eq!(replaced.generation(), snapshot.generation());
        assert_eq!(cursor.peek(&replaced).unwrap().id, other);
    }
}
