#![no_main]
use ags_sandbox::transport::codec::LineDecoder;
use libfuzzer_sys::fuzz_target;

// First byte picks the chunk size so split points vary.
fuzz_target!(|data: &[u8]| {
    let Some((&step, rest)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);
    let mut decoder = LineDecoder::new();
    let mut lines = Vec::new();
    for chunk in rest.chunks(step) {
        lines.extend(decoder.push(chunk));
    }
    lines.extend(decoder.finish());
    assert!(lines.iter().all(|l| !l.is_empty() && !l.contains('\n')));
});
