//! Binary envelope codec
//!
//! A compact alternative to the JSON form, distinguished on the wire by
//! its leading version byte (which can never be `{`). All integers are
//! network byte order; variable-length fields are length-prefixed. The
//! timestamp is written as raw IEEE-754 bits so a decode/re-encode cycle
//! leaves the signed bytes untouched.
//!
//! Layout: `u8 version`, then u8-length-prefixed `message_id`,
//! `from_peer_id`, `public_key`, `machine_id`, a presence flag plus
//! `to_peer_id`, `channel`, `u8 hop_count`, `f64 timestamp` (raw bits),
//! the payload (type tag byte + body), and the u8-length-prefixed
//! `signature`.

use omerta_core::{MachineId, NatType, PeerAnnouncement, PeerEndpointInfo, PeerId, ReachabilityPath};

use crate::envelope::Envelope;
use crate::error::{WireError, WireResult};
use crate::message::MeshMessage;

/// Version byte of the binary form. Must stay distinct from `{` (0x7B).
pub const BINARY_VERSION: u8 = 0x01;

/// Encode an envelope in the binary wire form
pub fn encode_binary(envelope: &Envelope) -> WireResult<Vec<u8>> {
    let mut w = Writer::default();
    w.put_u8(BINARY_VERSION);
    w.put_str8("message_id", &envelope.message_id)?;
    w.put_str8("from_peer_id", envelope.from_peer_id.as_str())?;
    w.put_str8("public_key", &envelope.public_key)?;
    w.put_str8("machine_id", &envelope.machine_id.as_string())?;
    match &envelope.to_peer_id {
        Some(to) => {
            w.put_u8(1);
            w.put_str8("to_peer_id", to.as_str())?;
        }
        None => w.put_u8(0),
    }
    w.put_str8("channel", &envelope.channel)?;
    w.put_u8(envelope.hop_count);
    w.put_f64(envelope.timestamp);
    encode_payload(&mut w, &envelope.payload)?;
    w.put_str8("signature", &envelope.signature)?;
    Ok(w.buf)
}

/// Decode the binary wire form
pub fn decode_binary(bytes: &[u8]) -> WireResult<Envelope> {
    let mut r = Reader::new(bytes);
    let version = r.u8()?;
    if version != BINARY_VERSION {
        return Err(WireError::UnknownVersion(version));
    }

    let message_id = r.str8()?;
    let from_peer_id = r.peer_id()?;
    let public_key = r.str8()?;
    let machine_id = MachineId::parse(&r.str8()?).map_err(|e| WireError::Malformed(e.to_string()))?;
    let to_peer_id = if r.bool()? { Some(r.peer_id()?) } else { None };
    let channel = r.str8()?;
    let hop_count = r.u8()?;
    let timestamp = r.f64()?;
    let payload = decode_payload(&mut r)?;
    let signature = r.str8()?;

    if !r.is_empty() {
        return Err(WireError::Malformed("trailing bytes".to_string()));
    }

    Ok(Envelope {
        message_id,
        from_peer_id,
        public_key,
        machine_id,
        to_peer_id,
        channel,
        hop_count,
        timestamp,
        payload,
        signature,
    })
}

fn type_tag(message: &MeshMessage) -> u8 {
    match message {
        MeshMessage::Ping { .. } => 1,
        MeshMessage::Pong { .. } => 2,
        MeshMessage::Data { .. } => 3,
        MeshMessage::Request { .. } => 4,
        MeshMessage::Response { .. } => 5,
        MeshMessage::Announce { .. } => 6,
        MeshMessage::FindPeer { .. } => 7,
        MeshMessage::PeerInfo { .. } => 8,
        MeshMessage::PeerNotFound { .. } => 9,
        MeshMessage::HolePunchRequest { .. } => 10,
        MeshMessage::HolePunchInvite { .. } => 11,
        MeshMessage::HolePunchExecute { .. } => 12,
        MeshMessage::RelayForward { .. } => 13,
        MeshMessage::RelayForwardResult { .. } => 14,
        MeshMessage::WhoHasRecent { .. } => 15,
        MeshMessage::IHaveRecent { .. } => 16,
        MeshMessage::PathFailed { .. } => 17,
    }
}

fn encode_payload(w: &mut Writer, message: &MeshMessage) -> WireResult<()> {
    w.put_u8(type_tag(message));
    match message {
        MeshMessage::Ping {
            recent_peers,
            my_nat_type,
            request_full_list,
        } => {
            w.put_peer_list(recent_peers)?;
            w.put_u8(nat_to_u8(*my_nat_type));
            w.put_bool(*request_full_list);
        }
        MeshMessage::Pong {
            recent_peers,
            your_endpoint,
            my_nat_type,
        } => {
            w.put_peer_list(recent_peers)?;
            w.put_str8("your_endpoint", your_endpoint)?;
            w.put_u8(nat_to_u8(*my_nat_type));
        }
        MeshMessage::Data { data } => w.put_bytes32(data),
        MeshMessage::Request { request_id, data } => {
            w.put_str8("request_id", request_id)?;
            w.put_bytes32(data);
        }
        MeshMessage::Response { request_id, data } => {
            w.put_str8("request_id", request_id)?;
            w.put_bytes32(data);
        }
        MeshMessage::Announce { announcement } => w.put_announcement(announcement)?,
        MeshMessage::FindPeer { peer_id } => w.put_str8("peer_id", peer_id.as_str())?,
        MeshMessage::PeerInfo { announcement } => w.put_announcement(announcement)?,
        MeshMessage::PeerNotFound { peer_id } => w.put_str8("peer_id", peer_id.as_str())?,
        MeshMessage::HolePunchRequest {
            request_id,
            target_peer_id,
            initiator_endpoint,
            initiator_nat_type,
        } => {
            w.put_str8("request_id", request_id)?;
            w.put_str8("target_peer_id", target_peer_id.as_str())?;
            w.put_str8("initiator_endpoint", initiator_endpoint)?;
            w.put_u8(nat_to_u8(*initiator_nat_type));
        }
        MeshMessage::HolePunchInvite {
            request_id,
            initiator_peer_id,
            initiator_endpoint,
            initiator_nat_type,
            accepted,
        } => {
            w.put_str8("request_id", request_id)?;
            w.put_str8("initiator_peer_id", initiator_peer_id.as_str())?;
            w.put_str8("initiator_endpoint", initiator_endpoint)?;
            w.put_u8(nat_to_u8(*initiator_nat_type));
            w.put_bool(*accepted);
        }
        MeshMessage::HolePunchExecute {
            request_id,
            target_endpoint,
            peer_endpoint,
            simultaneous_send,
        } => {
            w.put_str8("request_id", request_id)?;
            w.put_str8("target_endpoint", target_endpoint)?;
            match peer_endpoint {
                Some(endpoint) => {
                    w.put_u8(1);
                    w.put_str8("peer_endpoint", endpoint)?;
                }
                None => w.put_u8(0),
            }
            w.put_bool(*simultaneous_send);
        }
        MeshMessage::RelayForward {
            target_peer_id,
            payload,
        } => {
            w.put_str8("target_peer_id", target_peer_id.as_str())?;
            w.put_bytes32(payload);
        }
        MeshMessage::RelayForwardResult {
            target_peer_id,
            success,
        } => {
            w.put_str8("target_peer_id", target_peer_id.as_str())?;
            w.put_bool(*success);
        }
        MeshMessage::WhoHasRecent {
            peer_id,
            max_age_seconds,
        } => {
            w.put_str8("peer_id", peer_id.as_str())?;
            w.put_u64(*max_age_seconds);
        }
        MeshMessage::IHaveRecent {
            peer_id,
            last_seen_seconds_ago,
            reachability,
        } => {
            w.put_str8("peer_id", peer_id.as_str())?;
            w.put_u64(*last_seen_seconds_ago);
            w.put_path(reachability)?;
        }
        MeshMessage::PathFailed {
            peer_id,
            path,
            failed_at,
        } => {
            w.put_str8("peer_id", peer_id.as_str())?;
            w.put_path(path)?;
            w.put_f64(*failed_at);
        }
    }
    Ok(())
}

fn decode_payload(r: &mut Reader<'_>) -> WireResult<MeshMessage> {
    let tag = r.u8()?;
    let message = match tag {
        1 => MeshMessage::Ping {
            recent_peers: r.peer_list()?,
            my_nat_type: nat_from_u8(r.u8()?)?,
            request_full_list: r.bool()?,
        },
        2 => MeshMessage::Pong {
            recent_peers: r.peer_list()?,
            your_endpoint: r.str8()?,
            my_nat_type: nat_from_u8(r.u8()?)?,
        },
        3 => MeshMessage::Data { data: r.bytes32()? },
        4 => MeshMessage::Request {
            request_id: r.str8()?,
            data: r.bytes32()?,
        },
        5 => MeshMessage::Response {
            request_id: r.str8()?,
            data: r.bytes32()?,
        },
        6 => MeshMessage::Announce {
            announcement: r.announcement()?,
        },
        7 => MeshMessage::FindPeer { peer_id: r.peer_id()? },
        8 => MeshMessage::PeerInfo {
            announcement: r.announcement()?,
        },
        9 => MeshMessage::PeerNotFound { peer_id: r.peer_id()? },
        10 => MeshMessage::HolePunchRequest {
            request_id: r.str8()?,
            target_peer_id: r.peer_id()?,
            initiator_endpoint: r.str8()?,
            initiator_nat_type: nat_from_u8(r.u8()?)?,
        },
        11 => MeshMessage::HolePunchInvite {
            request_id: r.str8()?,
            initiator_peer_id: r.peer_id()?,
            initiator_endpoint: r.str8()?,
            initiator_nat_type: nat_from_u8(r.u8()?)?,
            accepted: r.bool()?,
        },
        12 => MeshMessage::HolePunchExecute {
            request_id: r.str8()?,
            target_endpoint: r.str8()?,
            peer_endpoint: if r.bool()? { Some(r.str8()?) } else { None },
            simultaneous_send: r.bool()?,
        },
        13 => MeshMessage::RelayForward {
            target_peer_id: r.peer_id()?,
            payload: r.bytes32()?,
        },
        14 => MeshMessage::RelayForwardResult {
            target_peer_id: r.peer_id()?,
            success: r.bool()?,
        },
        15 => MeshMessage::WhoHasRecent {
            peer_id: r.peer_id()?,
            max_age_seconds: r.u64()?,
        },
        16 => MeshMessage::IHaveRecent {
            peer_id: r.peer_id()?,
            last_seen_seconds_ago: r.u64()?,
            reachability: r.path()?,
        },
        17 => MeshMessage::PathFailed {
            peer_id: r.peer_id()?,
            path: r.path()?,
            failed_at: r.f64()?,
        },
        other => return Err(WireError::UnknownMessageType(other)),
    };
    Ok(message)
}

fn nat_to_u8(nat: NatType) -> u8 {
    match nat {
        NatType::Unknown => 0,
        NatType::Public => 1,
        NatType::FullCone => 2,
        NatType::RestrictedCone => 3,
        NatType::PortRestrictedCone => 4,
        NatType::Symmetric => 5,
    }
}

fn nat_from_u8(byte: u8) -> WireResult<NatType> {
    Ok(match byte {
        0 => NatType::Unknown,
        1 => NatType::Public,
        2 => NatType::FullCone,
        3 => NatType::RestrictedCone,
        4 => NatType::PortRestrictedCone,
        5 => NatType::Symmetric,
        other => return Err(WireError::Malformed(format!("bad nat type byte: {}", other))),
    })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn put_str8(&mut self, field: &'static str, s: &str) -> WireResult<()> {
        let bytes = s.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(WireError::StringTooLong {
                field,
                len: bytes.len(),
            });
        }
        self.put_u8(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn put_bytes32(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn put_path(&mut self, path: &ReachabilityPath) -> WireResult<()> {
        match path {
            ReachabilityPath::Direct { endpoint } => {
                self.put_u8(1);
                self.put_str8("endpoint", endpoint)?;
            }
            ReachabilityPath::Relay {
                relay_peer_id,
                relay_endpoint,
            } => {
                self.put_u8(2);
                self.put_str8("relay_peer_id", relay_peer_id.as_str())?;
                self.put_str8("relay_endpoint", relay_endpoint)?;
            }
            ReachabilityPath::HolePunch {
                public_ip,
                local_port,
            } => {
                self.put_u8(3);
                self.put_str8("public_ip", public_ip)?;
                self.put_u16(*local_port);
            }
        }
        Ok(())
    }

    fn put_peer_list(&mut self, peers: &[PeerEndpointInfo]) -> WireResult<()> {
        self.put_u16(peers.len() as u16);
        for info in peers {
            self.put_str8("peer_id", info.peer_id.as_str())?;
            self.put_str8("machine_id", &info.machine_id.as_string())?;
            self.put_str8("endpoint", &info.endpoint)?;
            self.put_u8(nat_to_u8(info.nat_type));
            self.put_bool(info.is_first_hand);
        }
        Ok(())
    }

    fn put_announcement(&mut self, a: &PeerAnnouncement) -> WireResult<()> {
        self.put_str8("peer_id", a.peer_id.as_str())?;
        self.put_str8("public_key", &a.public_key)?;
        self.put_u16(a.reachability.len() as u16);
        for path in &a.reachability {
            self.put_path(path)?;
        }
        self.put_u16(a.capabilities.len() as u16);
        for cap in &a.capabilities {
            self.put_str8("capability", cap)?;
        }
        self.put_f64(a.timestamp);
        self.put_u64(a.ttl_seconds);
        self.put_str8("signature", &a.signature)?;
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> WireResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> WireResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> WireResult<u64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn f64(&mut self) -> WireResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn bool(&mut self) -> WireResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Malformed(format!("bad bool byte: {}", other))),
        }
    }

    fn str8(&mut self) -> WireResult<String> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| WireError::Malformed(e.to_string()))
    }

    fn bytes32(&mut self) -> WireResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn peer_id(&mut self) -> WireResult<PeerId> {
        PeerId::parse(&self.str8()?).map_err(|e| WireError::Malformed(e.to_string()))
    }

    fn path(&mut self) -> WireResult<ReachabilityPath> {
        Ok(match self.u8()? {
            1 => ReachabilityPath::Direct { endpoint: self.str8()? },
            2 => ReachabilityPath::Relay {
                relay_peer_id: self.peer_id()?,
                relay_endpoint: self.str8()?,
            },
            3 => ReachabilityPath::HolePunch {
                public_ip: self.str8()?,
                local_port: self.u16()?,
            },
            other => return Err(WireError::Malformed(format!("bad path tag: {}", other))),
        })
    }

    fn peer_list(&mut self) -> WireResult<Vec<PeerEndpointInfo>> {
        let count = self.u16()? as usize;
        let mut peers = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            peers.push(PeerEndpointInfo {
                peer_id: self.peer_id()?,
                machine_id: MachineId::parse(&self.str8()?)
                    .map_err(|e| WireError::Malformed(e.to_string()))?,
                endpoint: self.str8()?,
                nat_type: nat_from_u8(self.u8()?)?,
                is_first_hand: self.bool()?,
            });
        }
        Ok(peers)
    }

    fn announcement(&mut self) -> WireResult<PeerAnnouncement> {
        let peer_id = self.peer_id()?;
        let public_key = self.str8()?;
        let reach_count = self.u16()? as usize;
        let mut reachability = Vec::with_capacity(reach_count.min(1024));
        for _ in 0..reach_count {
            reachability.push(self.path()?);
        }
        let cap_count = self.u16()? as usize;
        let mut capabilities = Vec::with_capacity(cap_count.min(1024));
        for _ in 0..cap_count {
            capabilities.push(self.str8()?);
        }
        Ok(PeerAnnouncement {
            peer_id,
            public_key,
            reachability,
            capabilities,
            timestamp: self.f64()?,
            ttl_seconds: self.u64()?,
            signature: self.str8()?,
        })
    }
}
