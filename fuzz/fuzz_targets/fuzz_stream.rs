#![no_main]

use bytes::BytesMut;
use framewire::core::codec::PacketCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

// The framing decoder must never panic on an arbitrary byte stream and
// must always either suspend, yield a frame, or fail with a typed error.
fuzz_target!(|data: &[u8]| {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(data);
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => break,
        }
    }
    let _ = codec.decode_eof(&mut buf);
});
