#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(info) = queue_watcher::ConnectionInfo::from_pairing_payload(s) {
        // Accepted descriptors always produce usable URLs.
        assert!(info.status_url().is_ok());
        let _ = info.command_url("/start-queue");
    }
});
