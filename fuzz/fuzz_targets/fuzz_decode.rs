#![no_main]

use framewire::core::packet::Packet;
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the decoder, and anything that decodes
// must survive a re-encode/decode round trip unchanged.
fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let bytes = packet.to_bytes().expect("decoded packet must re-encode");
        let again = Packet::from_bytes(&bytes).expect("re-encoded frame must decode");
        assert_eq!(again, packet);
    }
});
