#![no_main]

use libfuzzer_sys::fuzz_target;
use stackfall_server::protocol::ClientMessage;

fuzz_target!(|data: &[u8]| {
    // Inbound frames arrive as text, so only the str path matters here.
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = serde_json::from_str::<ClientMessage>(text) {
        // Anything that parses must serialize back without error.
        let _ = serde_json::to_string(&message);
    }
});
