//! The whole pipeline in one go: crash, capture, store, upload.

use faultline::{
    store::ReportState,
    upload::{UploadConfig, Uploader},
};
use faultline_test::{run_crash_client, CrashKind, TestHandler};
use httpmock::prelude::*;
use std::time::Duration;

#[test]
fn crash_report_reaches_the_collector() {
    let handler = TestHandler::spinup("pipeline");

    let status = run_crash_client(handler.socket(), CrashKind::Segv, 0);
    assert!(!status.success());

    let capture = handler.wait_capture(Duration::from_secs(30));
    let store = handler.shutdown();

    let collector = MockServer::start();
    let mock = collector.mock(|when, then| {
        when.method(POST)
            .path("/collect")
            // The multipart body carries the registered annotations
            .body_contains("1.0");
        then.status(200);
    });

    let mut config = UploadConfig::new(collector.url("/collect"));
    config.base_delay = Duration::ZERO;
    config.max_delay = Duration::ZERO;

    let uploader = Uploader::new(store.clone(), config).unwrap();
    assert!(uploader.process_one().unwrap());

    mock.assert_hits(1);
    assert_eq!(
        store.get(capture.report.id).unwrap().state,
        ReportState::Uploaded
    );

    // The artifact stays in the database after upload
    assert!(capture.report.artifact.exists());
}
