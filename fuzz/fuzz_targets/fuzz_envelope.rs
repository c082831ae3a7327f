#![no_main]

use bytes::Bytes;
use cm_protocol::core::envelope::Envelope;
use cm_protocol::core::multi;
use cm_protocol::core::registry::SchemaRegistry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any header layout, tunnel wrapper or multi container must fail cleanly
    let Ok(envelope) = Envelope::decode(Bytes::copy_from_slice(data)) else {
        return;
    };
    let _ = SchemaRegistry::default().decode(&envelope);
    let _ = envelope.unwrap_tunnel();
    let _ = multi::unpack(&envelope);
});
