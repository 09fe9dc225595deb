#![no_main]

use libfuzzer_sys::fuzz_target;

use brewlink::codec::{EncodedRequest, EncodedResponse};

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);

    // Arbitrary lines either decode or fail cleanly; valid decodes must
    // re-encode without panicking
    if let Ok(response) = EncodedResponse::from_line(&line) {
        let _ = response.to_line();
    }
    if let Ok(request) = EncodedRequest::from_line(&line) {
        let _ = request.to_line();
    }
});
