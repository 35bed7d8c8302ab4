#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes, including invalid UTF-8.
    let _ = queue_watcher::protocol::decode(data);

    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(msg) = queue_watcher::protocol::decode(s) {
            // Anything that decodes must print without panicking.
            let _ = msg.kind.to_string();
            let _ = msg.payload.queue_state.to_string();
        }
    }
});
