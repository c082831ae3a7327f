//! Protobuf schemas the engine itself needs.
//!
//! Everything else is application schema and is resolved through the
//! [`SchemaRegistry`](crate::core::registry::SchemaRegistry).

use prost::Message;

/// Job id sentinel used by protobuf headers for "no job".
pub const NO_JOB: u64 = u64::MAX;

/// Header embedded in every protobuf client message.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoHeader {
    #[prost(fixed64, optional, tag = "1")]
    pub steamid: Option<u64>,
    #[prost(int32, optional, tag = "2")]
    pub client_sessionid: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub routing_appid: Option<u32>,
    #[prost(fixed64, optional, tag = "10")]
    pub jobid_source: Option<u64>,
    #[prost(fixed64, optional, tag = "11")]
    pub jobid_target: Option<u64>,
    #[prost(string, optional, tag = "12")]
    pub target_job_name: Option<String>,
    #[prost(int32, optional, tag = "13")]
    pub eresult: Option<i32>,
    #[prost(string, optional, tag = "14")]
    pub error_message: Option<String>,
}

/// Header embedded in protobuf messages tunnelled to a sub-application.
#[derive(Clone, PartialEq, Message)]
pub struct GcProtoHeader {
    #[prost(fixed64, optional, tag = "1")]
    pub client_steam_id: Option<u64>,
    #[prost(int32, optional, tag = "2")]
    pub client_session_id: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub source_app_id: Option<u32>,
    #[prost(fixed64, optional, tag = "10")]
    pub job_id_source: Option<u64>,
    #[prost(fixed64, optional, tag = "11")]
    pub job_id_target: Option<u64>,
    #[prost(string, optional, tag = "12")]
    pub target_job_name: Option<String>,
    #[prost(int32, optional, tag = "13")]
    pub eresult: Option<i32>,
    #[prost(string, optional, tag = "14")]
    pub error_message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MultiBody {
    #[prost(uint32, optional, tag = "1")]
    pub size_unzipped: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub message_body: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartBeat {
    #[prost(bool, optional, tag = "1")]
    pub send_reply: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Logon {
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub cell_id: Option<u32>,
    #[prost(string, optional, tag = "6")]
    pub client_language: Option<String>,
    #[prost(uint32, optional, tag = "7")]
    pub client_os_type: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "30")]
    pub machine_id: Option<Vec<u8>>,
    #[prost(string, optional, tag = "50")]
    pub account_name: Option<String>,
    #[prost(string, optional, tag = "51")]
    pub password: Option<String>,
    #[prost(string, optional, tag = "108")]
    pub access_token: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LogonResponse {
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub out_of_game_heartbeat_seconds: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub in_game_heartbeat_seconds: Option<i32>,
    #[prost(uint32, optional, tag = "7")]
    pub cell_id: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LoggedOff {
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CmList {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub cm_addresses: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub cm_ports: Vec<u32>,
    #[prost(string, repeated, tag = "3")]
    pub cm_websocket_addresses: Vec<String>,
}

/// Wrapper addressing a message to a sub-application's own namespace.
#[derive(Clone, PartialEq, Message)]
pub struct GcEnvelope {
    #[prost(uint32, optional, tag = "1")]
    pub appid: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub msgtype: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
    #[prost(fixed64, optional, tag = "4")]
    pub steamid: Option<u64>,
    #[prost(string, optional, tag = "5")]
    pub gcname: Option<String>,
}
