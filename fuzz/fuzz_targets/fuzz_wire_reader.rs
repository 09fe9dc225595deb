#![no_main]

use libfuzzer_sys::fuzz_target;

use brewlink::codec::wire::WireReader;

fuzz_target!(|data: &[u8]| {
    let mut reader = WireReader::new(data);

    // Skipping every field must consume the input or fail, never spin
    while let Ok(Some((_tag, wire_type))) = reader.next_key() {
        if reader.skip(wire_type).is_err() {
            break;
        }
    }
});
