#![no_main]

use bytes::Bytes;
use cm_protocol::core::emsg::Universe;
use cm_protocol::core::envelope::Envelope;
use cm_protocol::protocol::handshake::{Handshake, UniverseKeys};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Hostile server messages during channel setup
    let mut handshake = Handshake::new(Universe::Public, UniverseKeys::new());
    handshake.connected();
    for chunk in data.split(|b| *b == 0xFF) {
        if let Ok(envelope) = Envelope::decode(Bytes::copy_from_slice(chunk)) {
            let _ = handshake.handle(&envelope);
        }
    }
});
