#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut consumed = 0usize;
    for message in peercore::messages(data) {
        match message {
            Ok(message) => {
                assert_eq!(message.size(), message.header.len() + message.body.len());
                consumed += message.size();
            }
            Err(_) => break,
        }
    }
    assert!(consumed <= data.len());
});
