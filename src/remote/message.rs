//! Distributed protocol messages
//!
//! Every message travels inside an `Envelope`: a fixed header carrying the
//! protocol version, a random correlation id, sender and recipient worker
//! ids, a timestamp, and a compression tag, followed by one type byte and
//! the type-specific payload. Integers are big-endian; strings, arrays,
//! and maps use the shared wire primitives.

use crate::cache::ActionId;
use crate::remote::capabilities::Capabilities;
use crate::remote::wire::{self, WireError, WireResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Worker identity; 0 is reserved for broadcast
pub type WorkerId = u64;
/// Correlation id carried by every envelope
pub type MessageId = u64;

/// The broadcast recipient
pub const BROADCAST: WorkerId = 0;
/// Protocol version this implementation speaks
pub const PROTOCOL_VERSION: u8 = 1;

/// Payload compression tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Payload travels as-is
    None,
    /// Zstandard; defined on the wire, not negotiated by this build
    Zstd,
    /// LZ4 block format with a size prefix
    Lz4,
}

impl Compression {
    fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
            Compression::Lz4 => 2,
        }
    }

    fn from_u8(value: u8) -> WireResult<Self> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            2 => Ok(Compression::Lz4),
            other => Err(WireError::UnknownCompression(other)),
        }
    }
}

/// Utilization and load snapshot a worker reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemMetrics {
    /// CPU utilization in [0, 1]
    pub cpu: f64,
    /// Memory utilization in [0, 1]
    pub memory: f64,
    /// Disk utilization in [0, 1]
    pub disk: f64,
    /// Actions queued but not started
    pub queue_depth: u32,
    /// Actions currently executing
    pub active_actions: u32,
}

impl SystemMetrics {
    fn encode<W: Write>(&self, w: &mut W) -> WireResult<()> {
        w.write_u64::<BigEndian>(self.cpu.to_bits())?;
        w.write_u64::<BigEndian>(self.memory.to_bits())?;
        w.write_u64::<BigEndian>(self.disk.to_bits())?;
        w.write_u32::<BigEndian>(self.queue_depth)?;
        w.write_u32::<BigEndian>(self.active_actions)?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> WireResult<Self> {
        Ok(Self {
            cpu: f64::from_bits(r.read_u64::<BigEndian>()?),
            memory: f64::from_bits(r.read_u64::<BigEndian>()?),
            disk: f64::from_bits(r.read_u64::<BigEndian>()?),
            queue_depth: r.read_u32::<BigEndian>()?,
            active_actions: r.read_u32::<BigEndian>()?,
        })
    }
}

/// One dispatchable action, as it travels to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    /// Content address of the action
    pub id: ActionId,
    /// Target the action belongs to
    pub target_id: String,
    /// Command line to execute
    pub command: String,
    /// Environment for the command
    pub env: HashMap<String, String>,
    /// Content hashes of the declared inputs
    pub input_hashes: Vec<String>,
    /// Sandbox contract
    pub capabilities: Capabilities,
}

impl ActionSpec {
    fn encode<W: Write>(&self, w: &mut W) -> WireResult<()> {
        w.write_all(self.id.as_bytes())?;
        wire::write_string(w, &self.target_id)?;
        wire::write_string(w, &self.command)?;
        wire::write_string_map(w, &self.env)?;
        wire::write_string_list(w, &self.input_hashes)?;
        self.capabilities.encode(w)?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> WireResult<Self> {
        let mut id = [0u8; 32];
        r.read_exact(&mut id)?;
        Ok(Self {
            id: ActionId::from_bytes(id),
            target_id: wire::read_string(r)?,
            command: wire::read_string(r)?,
            env: wire::read_string_map(r)?,
            input_hashes: wire::read_string_list(r)?,
            capabilities: Capabilities::decode(r)?,
        })
    }
}

/// A peer a worker can learn about through discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's worker id
    pub id: WorkerId,
    /// Where the peer listens
    pub address: String,
}

/// Everything that can travel between coordinator and workers
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A worker announces itself to the coordinator
    Registration {
        /// Where the worker listens
        address: String,
        /// Its initial load snapshot
        metrics: SystemMetrics,
    },
    /// Dispatch one action to a worker
    ActionRequest(ActionSpec),
    /// A worker reports an action's outcome
    ActionResult {
        /// The action
        id: ActionId,
        /// Whether it succeeded
        success: bool,
        /// Content address of the produced output, empty on failure
        output_hash: String,
        /// Diagnostics on failure
        message: String,
        /// Execution wall-clock in milliseconds
        duration_ms: u64,
    },
    /// Periodic liveness plus a metrics refresh
    HeartBeat {
        /// Current load snapshot
        metrics: SystemMetrics,
    },
    /// An idle worker asks a peer for work
    StealRequest {
        /// How many actions it can absorb
        count: u32,
    },
    /// Actions handed over to a stealing peer
    StealResponse {
        /// The transferred actions
        actions: Vec<ActionSpec>,
    },
    /// Coordinator tells a worker to stop
    Shutdown {
        /// Drain in-progress work before exiting
        graceful: bool,
        /// Drain budget in milliseconds
        timeout_ms: u64,
    },
    /// A worker advertises free capacity
    WorkRequest {
        /// Actions it can take
        capacity: u32,
    },
    /// Ask for known peers
    PeerDiscoveryRequest,
    /// Known peers
    PeerDiscoveryResponse {
        /// The peer list
        peers: Vec<PeerInfo>,
    },
    /// A new peer introduces itself to the mesh
    PeerAnnounce {
        /// The peer's id
        id: WorkerId,
        /// Where it listens
        address: String,
    },
    /// Out-of-band metrics refresh, cheaper than a heartbeat round
    PeerMetricsUpdate {
        /// Current load snapshot
        metrics: SystemMetrics,
    },
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Message::Registration { .. } => 0,
            Message::ActionRequest(_) => 1,
            Message::ActionResult { .. } => 2,
            Message::HeartBeat { .. } => 3,
            Message::StealRequest { .. } => 4,
            Message::StealResponse { .. } => 5,
            Message::Shutdown { .. } => 6,
            Message::WorkRequest { .. } => 7,
            Message::PeerDiscoveryRequest => 8,
            Message::PeerDiscoveryResponse { .. } => 9,
            Message::PeerAnnounce { .. } => 10,
            Message::PeerMetricsUpdate { .. } => 11,
        }
    }

    fn encode_payload<W: Write>(&self, w: &mut W) -> WireResult<()> {
        match self {
            Message::Registration { address, metrics } => {
                wire::write_string(w, address)?;
                metrics.encode(w)?;
            }
            Message::ActionRequest(spec) => spec.encode(w)?,
            Message::ActionResult {
                id,
                success,
                output_hash,
                message,
                duration_ms,
            } => {
                w.write_all(id.as_bytes())?;
                w.write_u8(u8::from(*success))?;
                wire::write_string(w, output_hash)?;
                wire::write_string(w, message)?;
                w.write_u64::<BigEndian>(*duration_ms)?;
            }
            Message::HeartBeat { metrics } | Message::PeerMetricsUpdate { metrics } => {
                metrics.encode(w)?;
            }
            Message::StealRequest { count } | Message::WorkRequest { capacity: count } => {
                w.write_u32::<BigEndian>(*count)?;
            }
            Message::StealResponse { actions } => {
                w.write_u32::<BigEndian>(actions.len() as u32)?;
                for action in actions {
                    action.encode(w)?;
                }
            }
            Message::Shutdown {
                graceful,
                timeout_ms,
            } => {
                w.write_u8(u8::from(*graceful))?;
                w.write_u64::<BigEndian>(*timeout_ms)?;
            }
            Message::PeerDiscoveryRequest => {}
            Message::PeerDiscoveryResponse { peers } => {
                w.write_u32::<BigEndian>(peers.len() as u32)?;
                for peer in peers {
                    w.write_u64::<BigEndian>(peer.id)?;
                    wire::write_string(w, &peer.address)?;
                }
            }
            Message::PeerAnnounce { id, address } => {
                w.write_u64::<BigEndian>(*id)?;
                wire::write_string(w, address)?;
            }
        }
        Ok(())
    }

    fn decode_payload<R: Read>(type_byte: u8, r: &mut R) -> WireResult<Self> {
        match type_byte {
            0 => Ok(Message::Registration {
                address: wire::read_string(r)?,
                metrics: SystemMetrics::decode(r)?,
            }),
            1 => Ok(Message::ActionRequest(ActionSpec::decode(r)?)),
            2 => {
                let mut id = [0u8; 32];
                r.read_exact(&mut id)?;
                Ok(Message::ActionResult {
                    id: ActionId::from_bytes(id),
                    success: r.read_u8()? != 0,
                    output_hash: wire::read_string(r)?,
                    message: wire::read_string(r)?,
                    duration_ms: r.read_u64::<BigEndian>()?,
                })
            }
            3 => Ok(Message::HeartBeat {
                metrics: SystemMetrics::decode(r)?,
            }),
            4 => Ok(Message::StealRequest {
                count: r.read_u32::<BigEndian>()?,
            }),
            5 => {
                let count = r.read_u32::<BigEndian>()?;
                if count > wire::MAX_FRAME_LEN {
                    return Err(WireError::LengthOverflow(count));
                }
                let mut actions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    actions.push(ActionSpec::decode(r)?);
                }
                Ok(Message::StealResponse { actions })
            }
            6 => Ok(Message::Shutdown {
                graceful: r.read_u8()? != 0,
                timeout_ms: r.read_u64::<BigEndian>()?,
            }),
            7 => Ok(Message::WorkRequest {
                capacity: r.read_u32::<BigEndian>()?,
            }),
            8 => Ok(Message::PeerDiscoveryRequest),
            9 => {
                let count = r.read_u32::<BigEndian>()?;
                if count > wire::MAX_FRAME_LEN {
                    return Err(WireError::LengthOverflow(count));
                }
                let mut peers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    peers.push(PeerInfo {
                        id: r.read_u64::<BigEndian>()?,
                        address: wire::read_string(r)?,
                    });
                }
                Ok(Message::PeerDiscoveryResponse { peers })
            }
            10 => Ok(Message::PeerAnnounce {
                id: r.read_u64::<BigEndian>()?,
                address: wire::read_string(r)?,
            }),
            11 => Ok(Message::PeerMetricsUpdate {
                metrics: SystemMetrics::decode(r)?,
            }),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Framing header plus one message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Protocol version
    pub version: u8,
    /// Random correlation id
    pub message_id: MessageId,
    /// Sending worker; coordinators also hold a worker id
    pub sender: WorkerId,
    /// Receiving worker, or `BROADCAST`
    pub recipient: WorkerId,
    /// Unix seconds at send time
    pub timestamp: i64,
    /// How the body is compressed
    pub compression: Compression,
    /// The message itself
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with a fresh random id and current timestamp
    pub fn new(sender: WorkerId, recipient: WorkerId, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id: rand::random(),
            sender,
            recipient,
            timestamp: chrono::Utc::now().timestamp(),
            compression: Compression::None,
            message,
        }
    }

    /// Select body compression
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Serialize header + type byte + payload, compressing the body
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut body = vec![self.message.type_byte()];
        self.message.encode_payload(&mut body)?;
        let body = compress(self.compression, body)?;

        let mut buf = Vec::with_capacity(body.len() + 32);
        buf.write_u8(self.version)?;
        buf.write_u64::<BigEndian>(self.message_id)?;
        buf.write_u64::<BigEndian>(self.sender)?;
        buf.write_u64::<BigEndian>(self.recipient)?;
        buf.write_i64::<BigEndian>(self.timestamp)?;
        buf.write_u8(self.compression.to_u8())?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parse one envelope from a complete frame
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        let mut r = std::io::Cursor::new(bytes);
        let version = r.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }
        let message_id = r.read_u64::<BigEndian>()?;
        let sender = r.read_u64::<BigEndian>()?;
        let recipient = r.read_u64::<BigEndian>()?;
        let timestamp = r.read_i64::<BigEndian>()?;
        let compression = Compression::from_u8(r.read_u8()?)?;

        let offset = r.position() as usize;
        let body = decompress(compression, &bytes[offset..])?;
        let mut body_r = std::io::Cursor::new(body.as_slice());
        let type_byte = body_r.read_u8()?;
        let message = Message::decode_payload(type_byte, &mut body_r)?;

        Ok(Self {
            version,
            message_id,
            sender,
            recipient,
            timestamp,
            compression,
            message,
        })
    }

    /// Write as a length-framed message: u32 frame length, then envelope
    pub fn write_framed<W: Write>(&self, w: &mut W) -> WireResult<()> {
        let bytes = self.encode()?;
        w.write_u32::<BigEndian>(bytes.len() as u32)?;
        w.write_all(&bytes)?;
        Ok(())
    }

    /// Read one length-framed envelope from a stream
    pub fn read_framed<R: Read>(r: &mut R) -> WireResult<Self> {
        let len = r.read_u32::<BigEndian>()?;
        if len > wire::MAX_FRAME_LEN {
            return Err(WireError::LengthOverflow(len));
        }
        let mut frame = vec![0u8; len as usize];
        r.read_exact(&mut frame)?;
        Self::decode(&frame)
    }
}

fn compress(compression: Compression, body: Vec<u8>) -> WireResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(body),
        Compression::Lz4 => lz4::block::compress(&body, None, true).map_err(WireError::from),
        Compression::Zstd => Err(WireError::UnsupportedCompression("zstd")),
    }
}

fn decompress(compression: Compression, body: &[u8]) -> WireResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(body.to_vec()),
        Compression::Lz4 => lz4::block::decompress(body, None).map_err(WireError::from),
        Compression::Zstd => Err(WireError::UnsupportedCompression("zstd")),
    }
}
