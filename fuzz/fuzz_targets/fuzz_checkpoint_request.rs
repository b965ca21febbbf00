#![no_main]

use libfuzzer_sys::fuzz_target;
use stackfall_server::run::CheckpointRequest;
use stackfall_server::scoring::{apply_checkpoint, SCORE_CEILING};

fuzz_target!(|data: &[u8]| {
    let Ok(request) = serde_json::from_slice::<CheckpointRequest>(data) else {
        return;
    };
    let Ok(checkpoint) = request.validate() else {
        return;
    };
    let update = apply_checkpoint(0, 0, checkpoint.lines, checkpoint.score_multiplier);
    assert!(update.score <= SCORE_CEILING);
    assert_eq!(update.lines, checkpoint.lines);
});
