#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for sub in peercore::sub_messages(data) {
        match sub {
            Ok(sub) => assert_eq!(sub.size as usize, peercore::SUB_HEADER_LEN + sub.payload.len()),
            Err(_) => break,
        }
    }
});
