//! Upload lifecycle tests against a mock collector.

use faultline::{
    protocol::Annotations,
    store::{ReportState, ReportStore},
    upload::{UploadConfig, Uploader},
};
use httpmock::prelude::*;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

fn annotations() -> Annotations {
    let mut annotations = Annotations::new();
    annotations.insert("ver".to_owned(), "1.0".to_owned());
    annotations.insert("build".to_owned(), "f00dface".to_owned());
    annotations
}

/// Zero delays so tests drive retries without sleeping
fn test_config(url: String) -> UploadConfig {
    let mut config = UploadConfig::new(url);
    config.max_attempts = 3;
    config.base_delay = Duration::ZERO;
    config.max_delay = Duration::ZERO;
    config
}

/// Creates a store with one pending report whose artifact exists on disk
fn seed_report(store: &ReportStore) -> Uuid {
    let id = Uuid::new_v4();
    std::fs::write(store.artifact_path(id), b"not a real artifact").unwrap();
    store.create(id, annotations()).unwrap();
    id
}

#[test]
fn delivers_and_never_retransmits() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(ReportStore::open(td.path()).unwrap());
    let id = seed_report(&store);

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(200);
    });

    let uploader = Uploader::new(store.clone(), test_config(server.url("/collect"))).unwrap();

    assert!(uploader.process_one().unwrap());
    assert_eq!(store.get(id).unwrap().state, ReportState::Uploaded);
    mock.assert_hits(1);

    // Nothing pending anymore; the uploaded report must not be sent again
    assert!(!uploader.process_one().unwrap());
    mock.assert_hits(1);
}

#[test]
fn abandons_after_max_transient_failures() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(ReportStore::open(td.path()).unwrap());
    let id = seed_report(&store);

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(503);
    });

    let uploader = Uploader::new(store.clone(), test_config(server.url("/collect"))).unwrap();

    while !store.get(id).unwrap().state.is_terminal() {
        assert!(uploader.process_one().unwrap());
    }

    let report = store.get(id).unwrap();
    assert_eq!(report.state, ReportState::Abandoned);
    assert_eq!(report.attempts, 3);
    mock.assert_hits(3);

    // Terminal means terminal
    assert!(!uploader.process_one().unwrap());
    mock.assert_hits(3);
}

#[test]
fn abandons_immediately_on_rejection() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(ReportStore::open(td.path()).unwrap());
    let id = seed_report(&store);

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(400);
    });

    let uploader = Uploader::new(store.clone(), test_config(server.url("/collect"))).unwrap();

    assert!(uploader.process_one().unwrap());
    assert_eq!(store.get(id).unwrap().state, ReportState::Abandoned);
    mock.assert_hits(1);
}

#[test]
fn abandons_reports_with_missing_artifacts() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(ReportStore::open(td.path()).unwrap());

    // Record exists but its artifact was never written
    let id = Uuid::new_v4();
    store.create(id, annotations()).unwrap();

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(200);
    });

    let uploader = Uploader::new(store.clone(), test_config(server.url("/collect"))).unwrap();

    assert!(uploader.process_one().unwrap());
    assert_eq!(store.get(id).unwrap().state, ReportState::Abandoned);
    mock.assert_hits(0);
}

#[test]
fn disabled_uploader_transmits_nothing() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(ReportStore::open(td.path()).unwrap());
    let id = seed_report(&store);

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(200);
    });

    let mut config = test_config(server.url("/collect"));
    config.enabled = false;

    let uploader = Uploader::new(store.clone(), config).unwrap();

    assert!(!uploader.process_one().unwrap());
    assert_eq!(store.get(id).unwrap().state, ReportState::Pending);
    mock.assert_hits(0);
}

#[test]
fn finishes_interrupted_uploads_after_restart() {
    let td = tempfile::tempdir().unwrap();

    let id = {
        let store = ReportStore::open(td.path()).unwrap();
        let id = seed_report(&store);
        store
            .transition(id, ReportState::Pending, ReportState::Uploading)
            .unwrap();
        id
    };

    // A fresh open stands in for a restarted handler
    let store = Arc::new(ReportStore::open(td.path()).unwrap());
    assert_eq!(store.get(id).unwrap().state, ReportState::Pending);

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(200);
    });

    let uploader = Uploader::new(store.clone(), test_config(server.url("/collect"))).unwrap();

    assert!(uploader.process_one().unwrap());
    assert_eq!(store.get(id).unwrap().state, ReportState::Uploaded);
    mock.assert_hits(1);
}

#[test]
fn rate_limit_caps_attempts_per_window() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(ReportStore::open(td.path()).unwrap());
    seed_report(&store);
    seed_report(&store);

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/collect");
        then.status(200);
    });

    let mut config = test_config(server.url("/collect"));
    config.rate_limit = Some(1);
    config.rate_window = Duration::from_secs(3600);

    let uploader = Uploader::new(store.clone(), config).unwrap();

    assert!(uploader.process_one().unwrap());
    // Second report stays queued until the window rolls over
    assert!(!uploader.process_one().unwrap());
    mock.assert_hits(1);
    assert_eq!(store.list(ReportState::Pending).len(), 1);
}
