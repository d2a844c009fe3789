use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use loopcast_core::{
    load_loopcast_config, ChannelSettings, CurrentProgram, LoopcastConfig, ProgramGuide,
    SettingsStore, SourceKind, StatusReport,
};
use tempfile::TempDir;

fn config_in(dir: &Path) -> LoopcastConfig {
    let mut config = load_loopcast_config("../configs/loopcast.toml").expect("load config");
    config.paths.base_dir = dir.to_string_lossy().into_owned();
    config
}

#[test]
fn shipped_config_loads() {
    let config = load_loopcast_config("../configs/loopcast.toml").unwrap();
    assert_eq!(config.arbitration.interval_seconds, 15);
    assert!(config.live.url_template.contains("{channel}"));
    assert!(config.segmenter_output().ends_with(&config.segmenter.output_name));
}

#[test]
fn settings_written_by_one_store_are_seen_by_another() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let writer = SettingsStore::new(config.settings_path());
    writer
        .update(|settings| {
            settings.live_channel = Some("creator".into());
            settings.add_source("@first");
        })
        .unwrap();

    let reader = SettingsStore::new(config.settings_path());
    let settings = reader.load().unwrap();
    assert_eq!(settings.live_channel(), Some("creator"));
    assert_eq!(settings.on_demand_sources, vec!["@first".to_string()]);
}

#[test]
fn settings_accept_camel_case_documents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{"liveChannel":"  ","youtube_channels":["@a"],"displayName":"Night"}"#,
    )
    .unwrap();
    let settings = SettingsStore::new(&path).load().unwrap();
    assert_eq!(settings.live_channel(), None);
    assert_eq!(settings.on_demand_sources, vec!["@a".to_string()]);
    assert_eq!(settings.display_name, "Night");
    assert_eq!(settings.quality_params, ChannelSettings::default().quality_params);
}

#[test]
fn guide_and_playlist_land_on_disk() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let guide = ProgramGuide::from_config(&config);
    let settings = ChannelSettings {
        display_name: "Night & Day".into(),
        ..ChannelSettings::default()
    };

    guide.write_playlist(&settings).unwrap();
    let playlist = fs::read_to_string(config.playlist_path()).unwrap();
    assert!(playlist.starts_with("#EXTM3U\n"));
    assert!(playlist.contains(&config.publish.stream_url));

    let program = CurrentProgram {
        label: "Live: creator".into(),
        kind: SourceKind::Live,
        started_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        duration_seconds: None,
    };
    guide.write_guide(&settings, Some(&program)).unwrap();
    let xml = fs::read_to_string(config.guide_path()).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("Night &amp; Day"));
    assert!(xml.contains("start=\"20240301120000 +0000\""));
    assert!(xml.contains("<title>Live: creator</title>"));
}

#[test]
fn status_report_survives_a_round_trip_through_disk() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let report = StatusReport {
        active_source_kind: Some(SourceKind::OnDemand),
        since: Some(Utc::now()),
        program: Some("On Demand: clip".into()),
        feeder_pid: Some(42),
        segmenter_pid: Some(41),
        segmenter_restarts: 1,
        catalog_items: 3,
        catalog_generation: 2,
        updated_at: Utc::now(),
    };
    report.write_to(&config.status_path()).unwrap();
    let raw = fs::read_to_string(config.status_path()).unwrap();
    assert!(raw.contains("\"activeSourceKind\""));
    assert_eq!(StatusReport::read_from(&config.status_path()).unwrap(), report);
}
