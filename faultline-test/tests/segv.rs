use faultline_test::{assert_crash_captured, CrashKind};

#[test]
fn captures_segfault() {
    assert_crash_captured(CrashKind::Segv);
}
