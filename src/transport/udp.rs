//! # UDP Transport
//!
//! Datagram transport with its own small reliability layer.
//!
//! ## Wire Format
//! ```text
//! [Magic "VS01" u32] [PayloadSize u16] [PacketType u8] [Flags u8]
//! [SourceConnId u32] [DestConnId u32] [SeqThis u32] [SeqAck u32]
//! [PacketsInMsg u32] [MsgStartSeq u32] [MsgSize u32] [Payload]
//! ```
//! All integers little-endian; the header is 36 bytes.
//!
//! ## Connection Setup
//! `ChallengeReq` → `Challenge{value, load}` → `Connect{value ^ mask}` → `Accept`.
//!
//! ## Reliability
//! Sequenced packets stay queued until a cumulative ack covers them. At most
//! [`AHEAD_COUNT`] packets are in flight; after [`RESEND_DELAY`] without an ack
//! the first [`RESEND_COUNT`] queued packets are sent again. A message larger
//! than [`MAX_PAYLOAD`] is split across packets sharing `MsgStartSeq` and is
//! delivered only once every part has arrived.
//!
//! [`UdpSession`] is the pure state machine; time is passed in and outbound
//! datagrams are collected for the driver task to write.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::discovery::Endpoint;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{channel_pair, ChannelDriver, DisconnectReason, FramedChannel, Transport};
use crate::utils::timeout::with_timeout_error;

/// "VS01" read as a little-endian u32.
pub const UDP_MAGIC: u32 = 0x3130_5356;
pub const UDP_HEADER_LEN: usize = 36;
/// Largest payload carried by one datagram.
pub const MAX_PAYLOAD: usize = 0x4DC;
pub const CHALLENGE_MASK: u32 = 0xA426_DF2B;

pub const RESEND_DELAY: Duration = Duration::from_secs(3);
pub const TIMEOUT_DELAY: Duration = Duration::from_secs(60);
pub const RESEND_COUNT: usize = 3;
pub const AHEAD_COUNT: u32 = 5;

/// First source connection id; each new connection moves it up by 256.
const INITIAL_CONN_ID: u32 = 512;
const CONN_ID_STEP: u32 = 256;
const RECV_BUFFER: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Invalid = 0,
    ChallengeReq = 1,
    Challenge = 2,
    Connect = 3,
    Accept = 4,
    Disconnect = 5,
    Data = 6,
    Datagram = 7,
}

impl PacketType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PacketType::ChallengeReq,
            2 => PacketType::Challenge,
            3 => PacketType::Connect,
            4 => PacketType::Accept,
            5 => PacketType::Disconnect,
            6 => PacketType::Data,
            7 => PacketType::Datagram,
            _ => PacketType::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub source_conn_id: u32,
    pub dest_conn_id: u32,
    pub seq_this: u32,
    pub seq_ack: u32,
    pub packets_in_msg: u32,
    pub msg_start_seq: u32,
    pub msg_size: u32,
}

impl UdpHeader {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            flags: 0,
            source_conn_id: INITIAL_CONN_ID,
            dest_conn_id: 0,
            seq_this: 0,
            seq_ack: 0,
            packets_in_msg: 0,
            msg_start_seq: 0,
            msg_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub header: UdpHeader,
    pub payload: Bytes,
}

impl UdpPacket {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let mut header = UdpHeader::new(packet_type);
        header.msg_size = payload.len() as u32;
        Self { header, payload }
    }

    pub fn encode(&self) -> Bytes {
        let h = &self.header;
        let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + self.payload.len());
        buf.put_u32_le(UDP_MAGIC);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u8(h.packet_type as u8);
        buf.put_u8(h.flags);
        buf.put_u32_le(h.source_conn_id);
        buf.put_u32_le(h.dest_conn_id);
        buf.put_u32_le(h.seq_this);
        buf.put_u32_le(h.seq_ack);
        buf.put_u32_le(h.packets_in_msg);
        buf.put_u32_le(h.msg_start_seq);
        buf.put_u32_le(h.msg_size);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < UDP_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: UDP_HEADER_LEN,
                available: datagram.len(),
            });
        }
        let mut buf = datagram;
        if buf.get_u32_le() != UDP_MAGIC {
            return Err(ProtocolError::InvalidHeader(constants::ERR_BAD_UDP_MAGIC));
        }
        let payload_size = buf.get_u16_le() as usize;
        let header = UdpHeader {
            packet_type: PacketType::from_u8(buf.get_u8()),
            flags: buf.get_u8(),
            source_conn_id: buf.get_u32_le(),
            dest_conn_id: buf.get_u32_le(),
            seq_this: buf.get_u32_le(),
            seq_ack: buf.get_u32_le(),
            packets_in_msg: buf.get_u32_le(),
            msg_start_seq: buf.get_u32_le(),
            msg_size: buf.get_u32_le(),
        };
        if payload_size > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedPacket(payload_size));
        }
        if buf.len() < payload_size {
            return Err(ProtocolError::Truncated {
                needed: payload_size,
                available: buf.len(),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[..payload_size]),
        })
    }
}

/// Build the `ChallengeReq` datagram a discovery probe sends.
pub fn challenge_request() -> Bytes {
    UdpPacket::new(PacketType::ChallengeReq, Bytes::new()).encode()
}

/// Read `(challenge, server_load)` from a `Challenge` datagram.
pub fn parse_challenge(datagram: &[u8]) -> Result<(u32, u32)> {
    let packet = UdpPacket::decode(datagram)?;
    if packet.header.packet_type != PacketType::Challenge {
        return Err(ProtocolError::DecodeError(format!(
            "expected challenge, got {:?}",
            packet.header.packet_type
        )));
    }
    let mut body = packet.payload.as_ref();
    if body.len() < 8 {
        return Err(ProtocolError::Truncated {
            needed: 8,
            available: body.len(),
        });
    }
    Ok((body.get_u32_le(), body.get_u32_le()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Idle,
    Challenging,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// What the session has to tell its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpEvent {
    Connected,
    Message(Bytes),
    Disconnected(DisconnectReason),
}

/// Reliability state machine for one UDP connection.
#[derive(Debug)]
pub struct UdpSession {
    state: UdpState,
    source_conn_id: u32,
    remote_conn_id: u32,
    server_load: Option<u32>,

    /// Next outgoing sequence number.
    out_seq: u32,
    /// Highest sequence number sent.
    out_seq_sent: u32,
    /// Highest sequence number the server acknowledged.
    out_seq_acked: u32,

    /// Highest sequence number received contiguously; what the next ack says.
    in_seq: u32,
    /// Highest sequence number acknowledged to the server.
    in_seq_acked: u32,
    /// Highest sequence number handed to the owner.
    in_seq_handled: u32,

    out_packets: VecDeque<UdpPacket>,
    in_packets: HashMap<u32, UdpPacket>,

    next_resend: Instant,
    timeout: Instant,

    transmit: VecDeque<Bytes>,
    events: VecDeque<UdpEvent>,
}

impl UdpSession {
    pub fn new(source_conn_id: u32, now: Instant) -> Self {
        Self {
            state: UdpState::Idle,
            source_conn_id,
            remote_conn_id: 0,
            server_load: None,
            out_seq: 1,
            out_seq_sent: 0,
            out_seq_acked: 0,
            in_seq: 0,
            in_seq_acked: 0,
            in_seq_handled: 0,
            out_packets: VecDeque::new(),
            in_packets: HashMap::new(),
            next_resend: now + RESEND_DELAY,
            timeout: now + TIMEOUT_DELAY,
            transmit: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> UdpState {
        self.state
    }

    pub fn remote_conn_id(&self) -> u32 {
        self.remote_conn_id
    }

    /// Load the server reported in its challenge.
    pub fn server_load(&self) -> Option<u32> {
        self.server_load
    }

    /// Packets queued and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.out_packets.len()
    }

    /// Start the connection by asking for a challenge.
    pub fn connect(&mut self, now: Instant) {
        if self.state != UdpState::Idle {
            return;
        }
        self.timeout = now + TIMEOUT_DELAY;
        self.next_resend = now + RESEND_DELAY;
        self.state = UdpState::Challenging;
        self.send_packet(UdpPacket::new(PacketType::ChallengeReq, Bytes::new()), now);
    }

    /// Queue one message, split across as many packets as needed.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.state != UdpState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        let count = data.len().div_ceil(MAX_PAYLOAD).max(1);
        let msg_start = self.out_seq;
        for i in 0..count {
            let start = (i * MAX_PAYLOAD).min(data.len());
            let end = ((i + 1) * MAX_PAYLOAD).min(data.len());
            let mut packet = UdpPacket::new(PacketType::Data, Bytes::copy_from_slice(&data[start..end]));
            packet.header.msg_size = data.len() as u32;
            self.send_sequenced(packet);
            if let Some(queued) = self.out_packets.back_mut() {
                queued.header.packets_in_msg = count as u32;
                queued.header.msg_start_seq = msg_start;
            }
        }
        Ok(())
    }

    /// Begin a graceful disconnect. Queued data is still delivered.
    pub fn disconnect(&mut self) {
        match self.state {
            UdpState::Idle | UdpState::Disconnected | UdpState::Disconnecting => {}
            _ => {
                self.state = UdpState::Disconnecting;
                self.send_sequenced(UdpPacket::new(PacketType::Disconnect, Bytes::new()));
            }
        }
    }

    /// Feed one received datagram. Malformed or foreign datagrams are ignored.
    pub fn receive(&mut self, datagram: &[u8], now: Instant) {
        let packet = match UdpPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "dropping malformed datagram");
                return;
            }
        };
        if self.remote_conn_id > 0 && packet.header.source_conn_id != self.remote_conn_id {
            return;
        }
        let header = packet.header;
        debug!(
            packet_type = ?header.packet_type,
            seq = header.seq_this,
            ack = header.seq_ack,
            bytes = packet.payload.len(),
            "datagram received"
        );

        self.timeout = now + TIMEOUT_DELAY;

        if header.packet_type == PacketType::Data && header.seq_this < self.in_seq {
            self.send_ack(now);
            return;
        }

        if self.out_seq_acked < header.seq_ack {
            self.out_seq_acked = header.seq_ack;
            if self.out_seq_sent < self.out_seq_acked {
                self.out_seq_sent = self.out_seq_acked;
            }
            let acked = self.out_seq_acked;
            self.out_packets.retain(|p| p.header.seq_this > acked);
            self.next_resend = now + RESEND_DELAY;
        }

        if header.seq_this == self.in_seq + 1 {
            self.in_seq += 1;
            while self.in_packets.contains_key(&(self.in_seq + 1)) {
                self.in_seq += 1;
            }
        }

        match header.packet_type {
            PacketType::Challenge => self.receive_challenge(packet, now),
            PacketType::Accept => self.receive_accept(header),
            PacketType::Data => self.receive_data(packet),
            PacketType::Disconnect => {
                info!("disconnected by server");
                self.send_ack(now);
                self.finish(DisconnectReason::RemoteClosed);
            }
            PacketType::Datagram => {}
            other => debug!(packet_type = ?other, "unexpected packet type"),
        }
    }

    /// Advance timers: detect inactivity, (re)send queued packets, ack.
    pub fn poll(&mut self, now: Instant) {
        if self.state == UdpState::Disconnected {
            return;
        }
        if now > self.timeout {
            warn!("udp connection timed out");
            self.finish(DisconnectReason::Timeout);
            return;
        }

        self.send_pending(now);

        if self.in_seq != self.in_seq_acked {
            self.send_ack(now);
        }

        if self.state == UdpState::Disconnecting && self.out_packets.is_empty() {
            debug!("graceful disconnect completed");
            self.finish(DisconnectReason::UserInitiated);
        }
    }

    /// When [`poll`](Self::poll) next has work to do.
    pub fn next_deadline(&self) -> Instant {
        if self.out_seq_sent > self.out_seq_acked {
            self.next_resend.min(self.timeout)
        } else {
            self.timeout
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<UdpEvent> {
        self.events.pop_front()
    }

    fn finish(&mut self, reason: DisconnectReason) {
        if self.state != UdpState::Disconnected {
            self.state = UdpState::Disconnected;
            self.events.push_back(UdpEvent::Disconnected(reason));
        }
    }

    fn send_sequenced(&mut self, mut packet: UdpPacket) {
        packet.header.seq_this = self.out_seq;
        packet.header.msg_start_seq = self.out_seq;
        packet.header.packets_in_msg = 1;
        self.out_packets.push_back(packet);
        self.out_seq += 1;
    }

    fn send_packet(&mut self, mut packet: UdpPacket, now: Instant) {
        packet.header.source_conn_id = self.source_conn_id;
        packet.header.dest_conn_id = self.remote_conn_id;
        packet.header.seq_ack = self.in_seq;
        self.in_seq_acked = self.in_seq;

        debug!(
            packet_type = ?packet.header.packet_type,
            seq = packet.header.seq_this,
            ack = packet.header.seq_ack,
            bytes = packet.payload.len(),
            "datagram sent"
        );
        self.transmit.push_back(packet.encode());

        // An idle, fully acked connection would otherwise trip the resend
        // check on its next packet.
        if self.out_seq_sent == self.out_seq_acked {
            self.next_resend = now + RESEND_DELAY;
        }
        if packet.header.seq_this > 0 {
            self.out_seq_sent = self.out_seq_sent.max(packet.header.seq_this);
        }
    }

    fn send_ack(&mut self, now: Instant) {
        self.send_packet(UdpPacket::new(PacketType::Datagram, Bytes::new()), now);
    }

    fn send_pending(&mut self, now: Instant) {
        if now > self.next_resend && self.out_seq_sent > self.out_seq_acked {
            if self.state == UdpState::Disconnecting {
                self.out_packets.clear();
            }
            debug!("sequenced packet resend required");
            let resend: Vec<UdpPacket> = self.out_packets.iter().take(RESEND_COUNT).cloned().collect();
            for packet in resend {
                self.send_packet(packet, now);
            }
            self.next_resend = now + RESEND_DELAY;
        } else if self.out_seq_sent < self.out_seq_acked + AHEAD_COUNT {
            let first = (self.out_seq_sent - self.out_seq_acked) as usize;
            let last = (AHEAD_COUNT as usize).min(self.out_packets.len());
            let ahead: Vec<UdpPacket> = self
                .out_packets
                .iter()
                .skip(first)
                .take(last.saturating_sub(first))
                .cloned()
                .collect();
            for packet in ahead {
                self.send_packet(packet, now);
            }
        }
    }

    fn receive_challenge(&mut self, packet: UdpPacket, now: Instant) {
        if self.state != UdpState::Challenging {
            return;
        }
        let mut body = packet.payload.as_ref();
        if body.len() < 8 {
            debug!("short challenge");
            return;
        }
        let challenge = body.get_u32_le();
        self.server_load = Some(body.get_u32_le());

        self.state = UdpState::Connecting;
        let mut connect = BytesMut::with_capacity(4);
        connect.put_u32_le(challenge ^ CHALLENGE_MASK);
        self.send_sequenced(UdpPacket::new(PacketType::Connect, connect.freeze()));
        self.in_seq_handled = packet.header.seq_this;
        self.send_pending(now);
    }

    fn receive_accept(&mut self, header: UdpHeader) {
        if self.state != UdpState::Connecting {
            return;
        }
        info!(remote_conn_id = header.source_conn_id, "udp connection established");
        self.remote_conn_id = header.source_conn_id;
        self.in_seq_handled = header.seq_this;
        self.state = UdpState::Connected;
        self.events.push_back(UdpEvent::Connected);
    }

    fn receive_data(&mut self, packet: UdpPacket) {
        if self.state != UdpState::Connected && self.state != UdpState::Disconnecting {
            return;
        }
        let seq = packet.header.seq_this;
        if seq <= self.in_seq_handled || self.in_packets.contains_key(&seq) {
            return;
        }
        self.in_packets.insert(seq, packet);
        while self.dispatch_message() {}
    }

    /// Parts in the next message if all of them have arrived, else 0.
    fn ready_message_parts(&self) -> u32 {
        let first = match self.in_packets.get(&(self.in_seq_handled + 1)) {
            Some(packet) => packet,
            None => return 0,
        };
        let parts = first.header.packets_in_msg.max(1);
        for i in 1..parts {
            if !self.in_packets.contains_key(&(self.in_seq_handled + 1 + i)) {
                return 0;
            }
        }
        parts
    }

    fn dispatch_message(&mut self) -> bool {
        let parts = self.ready_message_parts();
        if parts == 0 {
            return false;
        }
        let mut message = BytesMut::new();
        for _ in 0..parts {
            self.in_seq_handled += 1;
            if let Some(packet) = self.in_packets.remove(&self.in_seq_handled) {
                message.extend_from_slice(&packet.payload);
            }
        }
        debug!(bytes = message.len(), "dispatching message");
        self.events.push_back(UdpEvent::Message(message.freeze()));
        true
    }
}

/// Opens UDP channels; each connection gets a fresh source connection id.
#[derive(Debug)]
pub struct UdpTransport {
    connect_timeout: Duration,
    capacity: usize,
    next_conn_id: AtomicU32,
}

impl UdpTransport {
    pub fn new(connect_timeout: Duration, capacity: usize) -> Self {
        Self {
            connect_timeout,
            capacity,
            next_conn_id: AtomicU32::new(INITIAL_CONN_ID),
        }
    }
}

pub(crate) async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ProtocolError::ConnectionFailed(format!("{address}: no address resolved")))
}

async fn flush(socket: &UdpSocket, session: &mut UdpSession) -> Result<()> {
    while let Some(datagram) = session.poll_transmit() {
        socket.send(&datagram).await?;
    }
    Ok(())
}

#[async_trait]
impl Transport for UdpTransport {
    #[instrument(skip(self), fields(address = %endpoint.address()))]
    async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel> {
        let remote = resolve(endpoint.address()).await?;
        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;

        let conn_id = self.next_conn_id.fetch_add(CONN_ID_STEP, Ordering::Relaxed);
        let mut session = UdpSession::new(conn_id, Instant::now());
        session.connect(Instant::now());

        with_timeout_error(establish(&socket, &mut session), self.connect_timeout)
            .await
            .map_err(|e| match e {
                ProtocolError::Timeout => {
                    ProtocolError::ConnectionFailed(format!("{endpoint}: connect timed out"))
                }
                other => other,
            })?;

        let (channel, driver) = channel_pair(remote.to_string(), self.capacity);
        tokio::spawn(async move {
            let mut driver = driver;
            let reason = run(socket, session, &mut driver).await;
            debug!(%remote, %reason, "udp channel closed");
            driver.finish(reason);
        });
        Ok(channel)
    }
}

async fn establish(socket: &UdpSocket, session: &mut UdpSession) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        flush(socket, session).await?;
        while let Some(event) = session.poll_event() {
            match event {
                UdpEvent::Connected => return Ok(()),
                UdpEvent::Disconnected(reason) => {
                    return Err(ProtocolError::ConnectionFailed(reason.to_string()))
                }
                UdpEvent::Message(_) => {}
            }
        }
        tokio::select! {
            received = socket.recv(&mut buf) => {
                let n = received?;
                session.receive(&buf[..n], Instant::now());
            }
            _ = sleep_until(session.next_deadline()) => {}
        }
        session.poll(Instant::now());
    }
}

async fn run(socket: UdpSocket, mut session: UdpSession, driver: &mut ChannelDriver) -> DisconnectReason {
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut closing = false;
    loop {
        if let Err(e) = flush(&socket, &mut session).await {
            return DisconnectReason::Error(e.to_string());
        }
        while let Some(event) = session.poll_event() {
            match event {
                UdpEvent::Message(message) => {
                    if driver.incoming.send(message).await.is_err() && !closing {
                        closing = true;
                        session.disconnect();
                    }
                }
                UdpEvent::Disconnected(reason) => {
                    let _ = flush(&socket, &mut session).await;
                    return reason;
                }
                UdpEvent::Connected => {}
            }
        }

        let accepting = session.state() == UdpState::Connected;
        tokio::select! {
            _ = driver.shutdown.cancelled(), if !closing => {
                closing = true;
                session.disconnect();
            }
            frame = driver.outgoing.recv(), if accepting && !closing => match frame {
                Some(frame) => {
                    if let Err(e) = session.send(&frame) {
                        warn!(error = %e, "dropping frame on closing udp session");
                    }
                }
                None => {
                    closing = true;
                    session.disconnect();
                }
            },
            received = socket.recv(&mut buf) => match received {
                Ok(n) => session.receive(&buf[..n], Instant::now()),
                Err(e) => return DisconnectReason::Error(e.to_string()),
            },
            _ = sleep_until(session.next_deadline()) => {}
        }
        session.poll(Instant::now());
    }
}

/// Ask `address` for a challenge and report the load it advertises.
pub async fn probe_load(address: &str, timeout: Duration) -> Result<u32> {
    let remote = resolve(address).await?;
    let bind: SocketAddr = if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(remote).await?;
    socket.send(&challenge_request()).await?;

    with_timeout_error(
        async {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let n = socket.recv(&mut buf).await?;
                match parse_challenge(&buf[..n]) {
                    Ok((_, load)) => return Ok::<u32, ProtocolError>(load),
                    Err(e) => debug!(error = %e, "ignoring non-challenge reply"),
                }
            }
        },
        timeout,
    )
    .await
}
