//! Property-based tests using proptest
//!
//! Header layouts, envelopes and compression containers are checked across
//! randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use cm_protocol::core::emsg::{MsgType, WireTag, PROTO_MASK};
use cm_protocol::core::envelope::Envelope;
use cm_protocol::core::header::{
    BasicHeader, ExtendedHeader, Header, ProtoBufHeader, TunnelHeader, TunnelProtoBufHeader,
};
use cm_protocol::core::proto::{GcProtoHeader, ProtoHeader};
use cm_protocol::protocol::jobs::JobId;
use cm_protocol::utils::compression::{compress, decompress_detected, CompressionKind};
use proptest::prelude::*;

fn job_id() -> impl Strategy<Value = JobId> {
    prop_oneof![Just(JobId::INVALID), any::<u64>().prop_map(JobId)]
}

/// Types that take the extended or protobuf header; handshake types are excluded.
fn app_msg_type() -> impl Strategy<Value = MsgType> {
    (0u32..PROTO_MASK)
        .prop_filter("handshake types use the basic header", |t| !MsgType(*t).is_channel_encrypt())
        .prop_map(MsgType)
}

fn handshake_msg_type() -> impl Strategy<Value = MsgType> {
    prop_oneof![
        Just(MsgType::CHANNEL_ENCRYPT_REQUEST),
        Just(MsgType::CHANNEL_ENCRYPT_RESPONSE),
        Just(MsgType::CHANNEL_ENCRYPT_RESULT),
    ]
}

fn proto_header() -> impl Strategy<Value = ProtoHeader> {
    (
        proptest::option::of(any::<u64>()),
        proptest::option::of(any::<i32>()),
        proptest::option::of(any::<u64>()),
        proptest::option::of(any::<u64>()),
        proptest::option::of("[A-Za-z]{1,12}\\.[A-Za-z]{1,12}#[0-9]"),
        proptest::option::of(any::<i32>()),
    )
        .prop_map(|(steamid, session, source, target, name, eresult)| ProtoHeader {
            steamid,
            client_sessionid: session,
            jobid_source: source,
            jobid_target: target,
            target_job_name: name,
            eresult,
            ..ProtoHeader::default()
        })
}

fn gc_proto_header() -> impl Strategy<Value = GcProtoHeader> {
    (
        proptest::option::of(any::<u64>()),
        proptest::option::of(any::<u64>()),
        proptest::option::of(any::<u32>()),
    )
        .prop_map(|(source, target, app)| GcProtoHeader {
            job_id_source: source,
            job_id_target: target,
            source_app_id: app,
            ..GcProtoHeader::default()
        })
}

fn top_level_header() -> impl Strategy<Value = Header> {
    prop_oneof![
        (handshake_msg_type(), job_id(), job_id()).prop_map(|(msg_type, target_job, source_job)| {
            Header::Basic(BasicHeader {
                msg_type,
                target_job,
                source_job,
            })
        }),
        (app_msg_type(), job_id(), job_id(), any::<u64>(), any::<i32>()).prop_map(
            |(msg_type, target_job, source_job, account_id, session_id)| {
                Header::Extended(ExtendedHeader {
                    target_job,
                    source_job,
                    account_id,
                    session_id,
                    ..ExtendedHeader::new(msg_type)
                })
            }
        ),
        (app_msg_type(), proto_header())
            .prop_map(|(msg_type, proto)| Header::ProtoBuf(ProtoBufHeader { msg_type, proto })),
    ]
}

fn tunnel_header() -> impl Strategy<Value = Header> {
    prop_oneof![
        (app_msg_type(), job_id(), job_id()).prop_map(|(msg_type, target_job, source_job)| {
            Header::Tunnel(TunnelHeader {
                target_job,
                source_job,
                ..TunnelHeader::new(msg_type)
            })
        }),
        (app_msg_type(), gc_proto_header()).prop_map(|(msg_type, proto)| {
            Header::TunnelProtoBuf(TunnelProtoBufHeader { msg_type, proto })
        }),
    ]
}

// Property: every top-level header decodes back to itself and consumes exactly its own bytes
proptest! {
    #[test]
    fn prop_header_roundtrip(header in top_level_header()) {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        prop_assert_eq!(buf.len(), header.encoded_len());

        let mut slice = &buf[..];
        let decoded = Header::decode(&mut slice).expect("decode should not fail");
        prop_assert!(slice.is_empty());
        prop_assert_eq!(decoded, header);
    }
}

// Property: tunnelled headers decode with the type carried by their wrapper
proptest! {
    #[test]
    fn prop_tunnel_header_roundtrip(header in tunnel_header()) {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut slice = &buf[..];
        let decoded = Header::decode_tunnel(header.tag().to_raw(), &mut slice).expect("decode should not fail");
        prop_assert!(slice.is_empty());
        prop_assert_eq!(decoded, header);
    }
}

// Property: the protobuf flag is exactly the high bit of the raw type
proptest! {
    #[test]
    fn prop_wire_tag_high_bit(raw in any::<u32>()) {
        let tag = WireTag::from_raw(raw);
        prop_assert_eq!(tag.is_proto, raw & PROTO_MASK != 0);
        prop_assert_eq!(tag.msg_type, MsgType(raw & !PROTO_MASK));
        prop_assert_eq!(tag.to_raw(), raw);
    }
}

// Property: body and payload bytes survive an envelope roundtrip
proptest! {
    #[test]
    fn prop_extended_envelope_roundtrip(
        msg_type in app_msg_type(),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let envelope = Envelope::new(Header::Extended(ExtendedHeader::new(msg_type)), body.clone());
        let decoded = Envelope::decode(envelope.encode()).expect("decode should not fail");
        prop_assert_eq!(decoded.msg_type(), msg_type);
        prop_assert!(!decoded.is_proto());
        prop_assert_eq!(&decoded.body()[..], &body[..]);
    }
}

// Property: arbitrary bytes never panic the decoder
proptest! {
    #[test]
    fn prop_decode_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Envelope::decode(data.clone().into());
        let _ = decompress_detected(&data);
    }
}

// Property: every container restores the original bytes
proptest! {
    #[test]
    fn prop_compression_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        kind in prop_oneof![
            Just(CompressionKind::Lzma),
            Just(CompressionKind::VZip),
            Just(CompressionKind::VZstd),
            Just(CompressionKind::Gzip),
        ],
    ) {
        let packed = compress(&data, kind).expect("compression should not fail");
        prop_assert_eq!(CompressionKind::detect(&packed), Some(kind));
        let restored = decompress_detected(&packed).expect("decompression should not fail");
        prop_assert_eq!(restored, data);
    }
}
