use faultline_test::{assert_crash_captured, CrashKind};

#[test]
fn captures_abort() {
    assert_crash_captured(CrashKind::Abort);
}
