use std::collections::BTreeMap;
use std::fs;

use loopcast_core::catalog::{
    clear_cache_dir, evict_except, media_path, scan_cache_dir, write_sidecar,
};
use loopcast_core::{CatalogCache, FeedItem};
use tempfile::TempDir;

fn cached(dir: &std::path::Path, id: &str, title: &str) -> FeedItem {
    let item = FeedItem {
        id: id.into(),
        title: title.into(),
        local_path: media_path(dir, id),
        duration_seconds: 600,
        source: Some("@creator".into()),
        url: Some(format!("https://video.example/watch?v={id}")),
    };
    fs::write(&item.local_path, b"media").unwrap();
    write_sidecar(dir, &item).unwrap();
    item
}

#[test]
fn scan_prefers_sidecar_metadata() {
    let dir = TempDir::new().unwrap();
    cached(dir.path(), "abc", "A Title");
    fs::write(media_path(dir.path(), "bare"), b"media").unwrap();
    fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let items = scan_cache_dir(dir.path()).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items["abc"].title, "A Title");
    assert_eq!(items["abc"].duration_seconds, 600);
    assert_eq!(items["bare"].title, "bare");
    assert_eq!(items["bare"].duration_seconds, 0);
}

#[test]
fn eviction_keeps_only_the_published_set() {
    let dir = TempDir::new().unwrap();
    let keep = cached(dir.path(), "keep", "Keep");
    cached(dir.path(), "drop", "Drop");

    let mut wanted = BTreeMap::new();
    wanted.insert(keep.id.clone(), keep);
    evict_except(dir.path(), &wanted).unwrap();

    let left = scan_cache_dir(dir.path()).unwrap();
    assert_eq!(left.keys().collect::<Vec<_>>(), vec!["keep"]);
}

#[test]
fn published_snapshots_are_immutable() {
    let dir = TempDir::new().unwrap();
    let cache = CatalogCache::new();
    let first = cache.publish(scan_cache_dir(dir.path()).unwrap());
    assert!(first.is_empty());

    cached(dir.path(), "abc", "A Title");
    let second = cache.publish(scan_cache_dir(dir.path()).unwrap());
    assert!(first.is_empty());
    assert_eq!(second.len(), 1);
    assert!(second.generation() > first.generation());
    assert_eq!(cache.snapshot().generation(), second.generation());
}

#[test]
fn clearing_removes_everything() {
    let dir = TempDir::new().unwrap();
    cached(dir.path(), "a", "A");
    cached(dir.path(), "b", "B");
    assert_eq!(clear_cache_dir(dir.path()).unwrap(), 4);
    assert!(scan_cache_dir(dir.path()).unwrap().is_empty());
}
