#![no_main]
use ags_sandbox::transport::codec::EnvelopeDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&step, rest)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);
    let mut decoder = EnvelopeDecoder::new();
    let mut consumed = 0;
    for chunk in rest.chunks(step) {
        match decoder.push(chunk) {
            Ok(envelopes) => consumed += envelopes.iter().map(|e| 5 + e.payload.len()).sum::<usize>(),
            Err(_) => return,
        }
    }
    assert_eq!(consumed + decoder.pending(), rest.len());
});
