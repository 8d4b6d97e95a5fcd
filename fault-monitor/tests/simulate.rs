use fault_monitor::{FaultDisposition, FaultMonitor, Signal};
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

/// One test covering the whole lifecycle since the process-wide handlers
/// mean attach tests cannot run concurrently
#[test]
fn simulated_faults_reach_the_callback() {
    let seen = Arc::new(AtomicI32::new(0));
    let inner = seen.clone();

    #[allow(unsafe_code)]
    let monitor = FaultMonitor::attach(unsafe {
        fault_monitor::make_fault_event(move |event| {
            inner.store(event.signal, Ordering::SeqCst);
            FaultDisposition::Terminate
        })
    })
    .unwrap();

    // Only one monitor may be attached at a time
    #[allow(unsafe_code)]
    let second = FaultMonitor::attach(unsafe {
        fault_monitor::make_fault_event(|_event| FaultDisposition::Terminate)
    });
    assert!(matches!(
        second,
        Err(fault_monitor::Error::MonitorAlreadyAttached)
    ));

    let disposition = monitor.simulate_fault(Signal::Segv);
    assert_eq!(disposition, Some(FaultDisposition::Terminate));
    assert_eq!(seen.load(Ordering::SeqCst), libc::SIGSEGV);

    // Detach frees the slot for a fresh attach
    monitor.detach();

    #[allow(unsafe_code)]
    let monitor = FaultMonitor::attach(unsafe {
        fault_monitor::make_fault_event(|_event| FaultDisposition::Reraise)
    })
    .unwrap();

    assert_eq!(
        monitor.simulate_fault(Signal::Abort),
        Some(FaultDisposition::Reraise)
    );
}
