#![no_main]

use bytes::BytesMut;
use cm_protocol::core::codec::FrameCodec;
use cm_protocol::transport::udp::{parse_challenge, UdpPacket};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    let mut codec = FrameCodec;
    while let Ok(Some(_)) = codec.decode(&mut buf) {}

    let _ = UdpPacket::decode(data);
    let _ = parse_challenge(data);
});
