#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(set_key) = peercore::SetKey::parse(data) {
        let encoded = set_key.encode();
        let reparsed = peercore::wire::messages(&encoded)
            .next()
            .and_then(Result::ok)
            .map(|message| peercore::SetKey::parse(message.body));
        assert_eq!(reparsed, Some(Ok(set_key)));
    }
});
