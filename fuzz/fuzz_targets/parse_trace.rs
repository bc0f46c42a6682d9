#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(trace) = expanse_mc::Trace::parse(s) {
            let again = expanse_mc::Trace::parse(&trace.to_string());
            assert_eq!(again.ok(), Some(trace));
        }
    }
});
