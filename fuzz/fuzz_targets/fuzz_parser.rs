#![no_main]

use libfuzzer_sys::fuzz_target;

use brewlink::parser::FrameParser;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let mut parser = FrameParser::new();

    // Whole-input parse must terminate without panicking
    parser.push(&text);
    let events: Vec<String> = parser.events().collect();
    let data_lines: Vec<String> = parser.data().collect();

    // Chunked parses of the same input must agree
    let mut chunked = FrameParser::new();
    for chunk in text.as_bytes().chunks(3) {
        chunked.push(&String::from_utf8_lossy(chunk));
    }
    if !text.as_bytes().iter().any(|&b| b >= 0x80) {
        assert_eq!(chunked.events().collect::<Vec<_>>(), events);
        assert_eq!(chunked.data().collect::<Vec<_>>(), data_lines);
    }
});
