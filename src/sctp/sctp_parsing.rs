use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error as ThisError;

/// The number of bytes in the SCTP common header
pub const COMMON_HEADER_LENGTH: usize = 12;
/// The number of bytes in a chunk header (type, flags, length)
pub const CHUNK_HEADER_LENGTH: usize = 4;
/// The number of bytes before the user data of a DATA chunk
pub const DATA_CHUNK_LENGTH: usize = 16;
/// The fixed part of INIT and INIT-ACK
pub const INIT_CHUNK_LENGTH: usize = 20;
/// The fixed part of a SACK
pub const SACK_CHUNK_LENGTH: usize = 16;
/// The fixed part of an NR-SACK
pub const NR_SACK_CHUNK_LENGTH: usize = 20;
pub const SHUTDOWN_CHUNK_LENGTH: usize = 8;
/// The fixed part of a FORWARD-TSN
pub const FORWARD_TSN_CHUNK_LENGTH: usize = 8;

pub const DATA: u8 = 0;
pub const INIT: u8 = 1;
pub const INIT_ACK: u8 = 2;
pub const SACK: u8 = 3;
pub const HEARTBEAT: u8 = 4;
pub const HEARTBEAT_ACK: u8 = 5;
pub const ABORT: u8 = 6;
pub const SHUTDOWN: u8 = 7;
pub const SHUTDOWN_ACK: u8 = 8;
pub const ERROR: u8 = 9;
pub const COOKIE_ECHO: u8 = 10;
pub const COOKIE_ACK: u8 = 11;
pub const SHUTDOWN_COMPLETE: u8 = 14;
pub const NR_SACK: u8 = 16;
pub const RE_CONFIG: u8 = 130;
pub const FORWARD_TSN: u8 = 192;

const HEARTBEAT_INFO: u16 = 1;
const IPV4_ADDRESS: u16 = 5;
const IPV6_ADDRESS: u16 = 6;
const STATE_COOKIE: u16 = 7;
const UNRECOGNIZED_PARAMETER: u16 = 8;
const COOKIE_PRESERVATIVE: u16 = 9;
const SUPPORTED_ADDRESS_TYPES: u16 = 12;
const OUTGOING_SSN_RESET_REQUEST: u16 = 13;
const RECONFIG_RESPONSE: u16 = 16;
const FORWARD_TSN_SUPPORTED: u16 = 49152;

/// Flag on a SACK or NR-SACK carrying a trailing SACK sequence number
const SACK_SEQUENCE_FLAG: u8 = 0x01;
/// The T bit on ABORT and SHUTDOWN-COMPLETE
const REFLECTED_TAG_FLAG: u8 = 0x01;

/// Rounds a length up to the next multiple of four.
pub const fn add_padding(length: usize) -> usize {
    ((length + 3) >> 2) << 2
}

/// The SCTP common header found at the start of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommonHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Must equal the receiver's own tag, except on INIT (zero) and chunks
    /// sent with the T bit, which carry the sender's tag.
    pub verification_tag: u32,
    /// CRC32c over the packet. Zero unless `compute_checksum` is enabled.
    pub checksum: u32,
}

/// A parsed SCTP packet: the common header followed by bundled chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: CommonHeader,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    pub fn new(src_port: u16, dst_port: u16, verification_tag: u32) -> Self {
        Self {
            header: CommonHeader {
                src_port,
                dst_port,
                verification_tag,
                checksum: 0,
            },
            chunks: vec![],
        }
    }

    /// Parses a serialized packet. Unknown chunk types are kept as
    /// [`Chunk::Unknown`] so the receiver can act on their type bits.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(bytes);
        let src_port = reader.u16("common header")?;
        let dst_port = reader.u16("common header")?;
        let verification_tag = reader.u32("common header")?;
        let checksum = u32::from_le_bytes(reader.array("common header")?);

        #[cfg(feature = "compute_checksum")]
        {
            let actual = packet_checksum(bytes);
            if actual != checksum {
                return Err(ParseError::Checksum {
                    actual,
                    expected: checksum,
                });
            }
        }

        let mut chunks = vec![];
        while !reader.is_empty() {
            let chunk_type = reader.u8("chunk header")?;
            let flags = reader.u8("chunk header")?;
            let length = reader.u16("chunk header")? as usize;
            if length < CHUNK_HEADER_LENGTH {
                return Err(ParseError::ChunkLength { chunk_type, length });
            }
            let value = reader
                .take(length - CHUNK_HEADER_LENGTH, "chunk value")
                .map_err(|_| ParseError::ChunkLength { chunk_type, length })?;
            // The final chunk's padding is sometimes left off
            reader.skip_up_to(add_padding(length) - length);
            chunks.push(Chunk::parse(chunk_type, flags, value)?);
        }

        if chunks.is_empty() {
            return Err(ParseError::NoChunks);
        }

        Ok(Self {
            header: CommonHeader {
                src_port,
                dst_port,
                verification_tag,
                checksum,
            },
            chunks,
        })
    }

    /// Convert the packet to its serialized format, ready to hand to the
    /// network.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.header.src_port.to_be_bytes());
        out.extend_from_slice(&self.header.dst_port.to_be_bytes());
        out.extend_from_slice(&self.header.verification_tag.to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        for chunk in self.chunks.iter() {
            chunk.serialize_into(&mut out);
        }

        #[cfg(feature = "compute_checksum")]
        {
            let checksum = packet_checksum(&out);
            out[8..12].copy_from_slice(&checksum.to_le_bytes());
        }

        out
    }

    /// The serialized length in bytes
    pub fn len(&self) -> usize {
        COMMON_HEADER_LENGTH + self.chunks.iter().map(Chunk::padded_length).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Does the packet hold only control chunks?
    pub fn is_control(&self) -> bool {
        !self.chunks.iter().any(|c| matches!(c, Chunk::Data(_)))
    }
}

#[cfg(feature = "compute_checksum")]
fn packet_checksum(packet: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&packet[..8]);
    let crc = crc32c::crc32c_append(crc, &[0; 4]);
    crc32c::crc32c_append(crc, &packet[COMMON_HEADER_LENGTH..])
}

/// A single chunk bundled in a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(DataChunk),
    Init(Init),
    InitAck(Init),
    /// SACK or, when it carries non-renegable gap blocks, NR-SACK
    Sack(Sack),
    Heartbeat(Heartbeat),
    HeartbeatAck(Heartbeat),
    Abort(Abort),
    Shutdown { cum_tsn_ack: u32 },
    ShutdownAck,
    Error(Vec<ErrorCause>),
    CookieEcho(Vec<u8>),
    CookieAck,
    ShutdownComplete { reflected: bool },
    ForwardTsn(ForwardTsn),
    Reconfig(Vec<Parameter>),
    Unknown(UnknownChunk),
}

impl Chunk {
    fn parse(chunk_type: u8, flags: u8, value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(value);
        let chunk = match chunk_type {
            DATA => {
                let tsn = reader.u32("DATA")?;
                let stream = reader.u16("DATA")?;
                let ssn = reader.u16("DATA")?;
                let ppid = reader.u32("DATA")?;
                let payload = reader.rest().to_vec();
                if payload.is_empty() {
                    return Err(ParseError::NoUserData { tsn });
                }
                Chunk::Data(DataChunk {
                    tsn,
                    stream,
                    ssn,
                    ppid,
                    unordered: flags & DataChunk::UNORDERED != 0,
                    beginning: flags & DataChunk::BEGINNING != 0,
                    ending: flags & DataChunk::ENDING != 0,
                    immediate: flags & DataChunk::IMMEDIATE != 0,
                    payload,
                })
            }
            INIT | INIT_ACK => {
                let init = Init {
                    initiate_tag: reader.u32("INIT")?,
                    a_rwnd: reader.u32("INIT")?,
                    outbound_streams: reader.u16("INIT")?,
                    inbound_streams: reader.u16("INIT")?,
                    initial_tsn: reader.u32("INIT")?,
                    parameters: parse_parameters(&mut reader)?,
                };
                if chunk_type == INIT {
                    Chunk::Init(init)
                } else {
                    Chunk::InitAck(init)
                }
            }
            SACK => {
                let cum_tsn_ack = reader.u32("SACK")?;
                let a_rwnd = reader.u32("SACK")?;
                let gap_count = reader.u16("SACK")?;
                let duplicate_count = reader.u16("SACK")?;
                let gap_blocks = parse_gap_blocks(&mut reader, gap_count)?;
                let duplicates = parse_tsns(&mut reader, duplicate_count)?;
                let sequence = parse_sack_sequence(&mut reader, flags)?;
                Chunk::Sack(Sack {
                    cum_tsn_ack,
                    a_rwnd,
                    gap_blocks,
                    nr_gap_blocks: None,
                    duplicates,
                    sequence,
                })
            }
            NR_SACK => {
                let cum_tsn_ack = reader.u32("NR-SACK")?;
                let a_rwnd = reader.u32("NR-SACK")?;
                let gap_count = reader.u16("NR-SACK")?;
                let nr_gap_count = reader.u16("NR-SACK")?;
                let duplicate_count = reader.u16("NR-SACK")?;
                let _reserved = reader.u16("NR-SACK")?;
                let gap_blocks = parse_gap_blocks(&mut reader, gap_count)?;
                let nr_gap_blocks = parse_gap_blocks(&mut reader, nr_gap_count)?;
                let duplicates = parse_tsns(&mut reader, duplicate_count)?;
                let sequence = parse_sack_sequence(&mut reader, flags)?;
                Chunk::Sack(Sack {
                    cum_tsn_ack,
                    a_rwnd,
                    gap_blocks,
                    nr_gap_blocks: Some(nr_gap_blocks),
                    duplicates,
                    sequence,
                })
            }
            HEARTBEAT | HEARTBEAT_ACK => {
                let info = match parse_parameters(&mut reader)?.into_iter().next() {
                    Some(Parameter::HeartbeatInfo(info)) => info,
                    _ => return Err(ParseError::MissingHeartbeatInfo),
                };
                if chunk_type == HEARTBEAT {
                    Chunk::Heartbeat(Heartbeat { info })
                } else {
                    Chunk::HeartbeatAck(Heartbeat { info })
                }
            }
            ABORT => Chunk::Abort(Abort {
                reflected: flags & REFLECTED_TAG_FLAG != 0,
                causes: parse_causes(&mut reader)?,
            }),
            SHUTDOWN => Chunk::Shutdown {
                cum_tsn_ack: reader.u32("SHUTDOWN")?,
            },
            SHUTDOWN_ACK => Chunk::ShutdownAck,
            ERROR => Chunk::Error(parse_causes(&mut reader)?),
            COOKIE_ECHO => Chunk::CookieEcho(reader.rest().to_vec()),
            COOKIE_ACK => Chunk::CookieAck,
            SHUTDOWN_COMPLETE => Chunk::ShutdownComplete {
                reflected: flags & REFLECTED_TAG_FLAG != 0,
            },
            FORWARD_TSN => {
                let new_cum_tsn = reader.u32("FORWARD-TSN")?;
                let mut streams = vec![];
                while reader.len() >= 4 {
                    streams.push(SkippedStream {
                        stream: reader.u16("FORWARD-TSN")?,
                        ssn: reader.u16("FORWARD-TSN")?,
                    });
                }
                Chunk::ForwardTsn(ForwardTsn {
                    new_cum_tsn,
                    streams,
                })
            }
            RE_CONFIG => Chunk::Reconfig(parse_parameters(&mut reader)?),
            _ => Chunk::Unknown(UnknownChunk {
                chunk_type,
                flags,
                value: value.to_vec(),
            }),
        };
        Ok(chunk)
    }

    /// The chunk type code as it appears on the wire
    pub fn type_id(&self) -> u8 {
        match self {
            Chunk::Data(_) => DATA,
            Chunk::Init(_) => INIT,
            Chunk::InitAck(_) => INIT_ACK,
            Chunk::Sack(sack) if sack.nr_gap_blocks.is_some() => NR_SACK,
            Chunk::Sack(_) => SACK,
            Chunk::Heartbeat(_) => HEARTBEAT,
            Chunk::HeartbeatAck(_) => HEARTBEAT_ACK,
            Chunk::Abort(_) => ABORT,
            Chunk::Shutdown { .. } => SHUTDOWN,
            Chunk::ShutdownAck => SHUTDOWN_ACK,
            Chunk::Error(_) => ERROR,
            Chunk::CookieEcho(_) => COOKIE_ECHO,
            Chunk::CookieAck => COOKIE_ACK,
            Chunk::ShutdownComplete { .. } => SHUTDOWN_COMPLETE,
            Chunk::ForwardTsn(_) => FORWARD_TSN,
            Chunk::Reconfig(_) => RE_CONFIG,
            Chunk::Unknown(unknown) => unknown.chunk_type,
        }
    }

    /// A short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Chunk::Data(_) => "DATA",
            Chunk::Init(_) => "INIT",
            Chunk::InitAck(_) => "INIT_ACK",
            Chunk::Sack(sack) if sack.nr_gap_blocks.is_some() => "NR_SACK",
            Chunk::Sack(_) => "SACK",
            Chunk::Heartbeat(_) => "HEARTBEAT",
            Chunk::HeartbeatAck(_) => "HEARTBEAT_ACK",
            Chunk::Abort(_) => "ABORT",
            Chunk::Shutdown { .. } => "SHUTDOWN",
            Chunk::ShutdownAck => "SHUTDOWN_ACK",
            Chunk::Error(_) => "ERROR",
            Chunk::CookieEcho(_) => "COOKIE_ECHO",
            Chunk::CookieAck => "COOKIE_ACK",
            Chunk::ShutdownComplete { .. } => "SHUTDOWN_COMPLETE",
            Chunk::ForwardTsn(_) => "FORWARD_TSN",
            Chunk::Reconfig(_) => "RE_CONFIG",
            Chunk::Unknown(_) => "UNKNOWN",
        }
    }

    /// The serialized length including padding
    pub fn padded_length(&self) -> usize {
        match self {
            Chunk::Data(data) => add_padding(DATA_CHUNK_LENGTH + data.payload.len()),
            Chunk::Sack(sack) => add_padding(sack.length()),
            Chunk::ForwardTsn(forward) => {
                FORWARD_TSN_CHUNK_LENGTH + forward.streams.len() * 4
            }
            other => {
                let mut out = vec![];
                other.serialize_into(&mut out);
                out.len()
            }
        }
    }

    /// Appends the padded serialization of this chunk to `out`.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        match self {
            Chunk::Data(data) => write_chunk(out, DATA, data.flags(), |out| {
                out.extend_from_slice(&data.tsn.to_be_bytes());
                out.extend_from_slice(&data.stream.to_be_bytes());
                out.extend_from_slice(&data.ssn.to_be_bytes());
                out.extend_from_slice(&data.ppid.to_be_bytes());
                out.extend_from_slice(&data.payload);
            }),
            Chunk::Init(init) => write_chunk(out, INIT, 0, |out| init.serialize_into(out)),
            Chunk::InitAck(init) => {
                write_chunk(out, INIT_ACK, 0, |out| init.serialize_into(out))
            }
            Chunk::Sack(sack) => {
                let flags = if sack.sequence.is_some() {
                    SACK_SEQUENCE_FLAG
                } else {
                    0
                };
                write_chunk(out, self.type_id(), flags, |out| sack.serialize_into(out))
            }
            Chunk::Heartbeat(heartbeat) => write_chunk(out, HEARTBEAT, 0, |out| {
                write_parameter(out, &Parameter::HeartbeatInfo(heartbeat.info.clone()))
            }),
            Chunk::HeartbeatAck(heartbeat) => write_chunk(out, HEARTBEAT_ACK, 0, |out| {
                write_parameter(out, &Parameter::HeartbeatInfo(heartbeat.info.clone()))
            }),
            Chunk::Abort(abort) => {
                let flags = if abort.reflected { REFLECTED_TAG_FLAG } else { 0 };
                write_chunk(out, ABORT, flags, |out| write_causes(out, &abort.causes))
            }
            Chunk::Shutdown { cum_tsn_ack } => write_chunk(out, SHUTDOWN, 0, |out| {
                out.extend_from_slice(&cum_tsn_ack.to_be_bytes())
            }),
            Chunk::ShutdownAck => write_chunk(out, SHUTDOWN_ACK, 0, |_| {}),
            Chunk::Error(causes) => write_chunk(out, ERROR, 0, |out| write_causes(out, causes)),
            Chunk::CookieEcho(cookie) => {
                write_chunk(out, COOKIE_ECHO, 0, |out| out.extend_from_slice(cookie))
            }
            Chunk::CookieAck => write_chunk(out, COOKIE_ACK, 0, |_| {}),
            Chunk::ShutdownComplete { reflected } => {
                let flags = if *reflected { REFLECTED_TAG_FLAG } else { 0 };
                write_chunk(out, SHUTDOWN_COMPLETE, flags, |_| {})
            }
            Chunk::ForwardTsn(forward) => write_chunk(out, FORWARD_TSN, 0, |out| {
                out.extend_from_slice(&forward.new_cum_tsn.to_be_bytes());
                for skipped in forward.streams.iter() {
                    out.extend_from_slice(&skipped.stream.to_be_bytes());
                    out.extend_from_slice(&skipped.ssn.to_be_bytes());
                }
            }),
            Chunk::Reconfig(parameters) => write_chunk(out, RE_CONFIG, 0, |out| {
                for parameter in parameters.iter() {
                    write_parameter(out, parameter);
                }
            }),
            Chunk::Unknown(unknown) => {
                write_chunk(out, unknown.chunk_type, unknown.flags, |out| {
                    out.extend_from_slice(&unknown.value)
                })
            }
        }
    }
}

/// A fragment of a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub tsn: u32,
    pub stream: u16,
    pub ssn: u16,
    /// Payload protocol identifier, opaque to SCTP
    pub ppid: u32,
    pub unordered: bool,
    /// First fragment of a message
    pub beginning: bool,
    /// Last fragment of a message
    pub ending: bool,
    /// Asks the receiver to acknowledge without delay
    pub immediate: bool,
    pub payload: Vec<u8>,
}

impl DataChunk {
    const ENDING: u8 = 0x01;
    const BEGINNING: u8 = 0x02;
    const UNORDERED: u8 = 0x04;
    const IMMEDIATE: u8 = 0x08;

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.ending {
            flags |= Self::ENDING;
        }
        if self.beginning {
            flags |= Self::BEGINNING;
        }
        if self.unordered {
            flags |= Self::UNORDERED;
        }
        if self.immediate {
            flags |= Self::IMMEDIATE;
        }
        flags
    }
}

/// The body shared by INIT and INIT-ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub parameters: Vec<Parameter>,
}

impl Init {
    /// The transport addresses listed by the sender
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.parameters.iter().filter_map(|p| match p {
            Parameter::Ipv4(address) => Some(IpAddr::V4(*address)),
            Parameter::Ipv6(address) => Some(IpAddr::V6(*address)),
            _ => None,
        })
    }

    pub fn cookie(&self) -> Option<&[u8]> {
        self.parameters.iter().find_map(|p| match p {
            Parameter::StateCookie(cookie) => Some(cookie.as_slice()),
            _ => None,
        })
    }

    pub fn forward_tsn_supported(&self) -> bool {
        self.parameters
            .iter()
            .any(|p| matches!(p, Parameter::ForwardTsnSupported))
    }

    /// Unknown parameters whose type bits ask the receiver to report them
    pub fn reportable_unknown_parameters(&self) -> impl Iterator<Item = &Parameter> + '_ {
        self.parameters.iter().filter(|p| match p {
            Parameter::Unknown { param_type, .. } => param_type & 0x4000 != 0,
            _ => false,
        })
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.initiate_tag.to_be_bytes());
        out.extend_from_slice(&self.a_rwnd.to_be_bytes());
        out.extend_from_slice(&self.outbound_streams.to_be_bytes());
        out.extend_from_slice(&self.inbound_streams.to_be_bytes());
        out.extend_from_slice(&self.initial_tsn.to_be_bytes());
        for parameter in self.parameters.iter() {
            write_parameter(out, parameter);
        }
    }
}

/// One gap-ack block, as offsets from the cumulative TSN ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GapBlock {
    pub start: u16,
    pub end: u16,
}

/// A selective acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sack {
    pub cum_tsn_ack: u32,
    pub a_rwnd: u32,
    pub gap_blocks: Vec<GapBlock>,
    /// Present only on NR-SACK
    pub nr_gap_blocks: Option<Vec<GapBlock>>,
    pub duplicates: Vec<u32>,
    /// SACK sequence number when sequence checking is enabled
    pub sequence: Option<u32>,
}

impl Sack {
    fn length(&self) -> usize {
        let fixed = match &self.nr_gap_blocks {
            Some(nr) => NR_SACK_CHUNK_LENGTH + nr.len() * 4,
            None => SACK_CHUNK_LENGTH,
        };
        fixed
            + self.gap_blocks.len() * 4
            + self.duplicates.len() * 4
            + self.sequence.map_or(0, |_| 4)
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cum_tsn_ack.to_be_bytes());
        out.extend_from_slice(&self.a_rwnd.to_be_bytes());
        out.extend_from_slice(&(self.gap_blocks.len() as u16).to_be_bytes());
        if let Some(nr) = &self.nr_gap_blocks {
            out.extend_from_slice(&(nr.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&(self.duplicates.len() as u16).to_be_bytes());
        if self.nr_gap_blocks.is_some() {
            out.extend_from_slice(&[0; 2]);
        }
        let nr = self.nr_gap_blocks.iter().flatten();
        for block in self.gap_blocks.iter().chain(nr) {
            out.extend_from_slice(&block.start.to_be_bytes());
            out.extend_from_slice(&block.end.to_be_bytes());
        }
        for tsn in self.duplicates.iter() {
            out.extend_from_slice(&tsn.to_be_bytes());
        }
        if let Some(sequence) = self.sequence {
            out.extend_from_slice(&sequence.to_be_bytes());
        }
    }
}

/// HEARTBEAT and HEARTBEAT-ACK carry opaque sender information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Abort {
    /// Set when the verification tag is the sender's own
    pub reflected: bool,
    pub causes: Vec<ErrorCause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTsn {
    pub new_cum_tsn: u32,
    pub streams: Vec<SkippedStream>,
}

/// The largest skipped SSN of an ordered stream in a FORWARD-TSN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedStream {
    pub stream: u16,
    pub ssn: u16,
}

/// A chunk type this implementation does not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChunk {
    pub chunk_type: u8,
    pub flags: u8,
    pub value: Vec<u8>,
}

impl UnknownChunk {
    /// The high bit clear means the rest of the packet must be discarded.
    pub fn stops_processing(&self) -> bool {
        self.chunk_type & 0x80 == 0
    }

    /// The second bit set asks for an ERROR report.
    pub fn wants_report(&self) -> bool {
        self.chunk_type & 0x40 != 0
    }

    /// The chunk as it appeared on the wire
    pub fn raw(&self) -> Vec<u8> {
        let mut out = vec![];
        Chunk::Unknown(self.clone()).serialize_into(&mut out);
        out
    }
}

/// A variable-length parameter inside INIT, INIT-ACK, HEARTBEAT or RE-CONFIG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    HeartbeatInfo(Vec<u8>),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    StateCookie(Vec<u8>),
    /// Echoes an unknown parameter back to its sender
    UnrecognizedParameter(Vec<u8>),
    CookiePreservative(u32),
    SupportedAddressTypes(Vec<u16>),
    ForwardTsnSupported,
    OutgoingSsnResetRequest {
        request_sequence: u32,
        response_sequence: u32,
        last_tsn: u32,
        streams: Vec<u16>,
    },
    ReconfigResponse {
        response_sequence: u32,
        result: u32,
    },
    Unknown {
        param_type: u16,
        value: Vec<u8>,
    },
}

impl Parameter {
    /// A successful RE-CONFIG result code
    pub const RESULT_SUCCESS: u32 = 1;
    /// The request was well-formed but could not be honored
    pub const RESULT_DENIED: u32 = 2;
    /// The receiver is still waiting on outstanding data
    pub const RESULT_IN_PROGRESS: u32 = 6;

    pub fn address(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(v4) => Parameter::Ipv4(v4),
            IpAddr::V6(v6) => Parameter::Ipv6(v6),
        }
    }

    /// The parameter as it appeared on the wire
    pub fn raw(&self) -> Vec<u8> {
        let mut out = vec![];
        write_parameter(&mut out, self);
        out
    }
}

/// A cause carried in ABORT or ERROR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub code: u16,
    pub info: Vec<u8>,
}

impl ErrorCause {
    pub const INVALID_STREAM_IDENTIFIER: u16 = 1;
    pub const STALE_COOKIE: u16 = 3;
    pub const OUT_OF_RESOURCE: u16 = 4;
    pub const UNRECOGNIZED_CHUNK_TYPE: u16 = 6;
    pub const UNRECOGNIZED_PARAMETERS: u16 = 8;
    pub const NO_USER_DATA: u16 = 9;
    pub const USER_INITIATED_ABORT: u16 = 12;
    pub const PROTOCOL_VIOLATION: u16 = 13;

    pub fn invalid_stream(stream: u16) -> Self {
        let mut info = stream.to_be_bytes().to_vec();
        info.extend_from_slice(&[0; 2]);
        Self {
            code: Self::INVALID_STREAM_IDENTIFIER,
            info,
        }
    }

    pub fn unrecognized_chunk(chunk: &UnknownChunk) -> Self {
        Self {
            code: Self::UNRECOGNIZED_CHUNK_TYPE,
            info: chunk.raw(),
        }
    }

    /// Carries unknown INIT-ACK parameters back to their sender.
    pub fn unrecognized_parameters<'a>(parameters: impl IntoIterator<Item = &'a Parameter>) -> Self {
        Self {
            code: Self::UNRECOGNIZED_PARAMETERS,
            info: parameters.into_iter().flat_map(Parameter::raw).collect(),
        }
    }

    pub fn protocol_violation(reason: &str) -> Self {
        Self {
            code: Self::PROTOCOL_VIOLATION,
            info: reason.as_bytes().to_vec(),
        }
    }

    pub fn user_abort(reason: &str) -> Self {
        Self {
            code: Self::USER_INITIATED_ABORT,
            info: reason.as_bytes().to_vec(),
        }
    }

    pub fn stale_cookie(staleness_micros: u32) -> Self {
        Self {
            code: Self::STALE_COOKIE,
            info: staleness_micros.to_be_bytes().to_vec(),
        }
    }
}

/// An error that occurred while parsing an SCTP packet
#[derive(Debug, ThisError, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("Too few bytes to constitute the {0}")]
    Truncated(&'static str),
    #[error("Chunk of type {chunk_type} has an invalid length {length}")]
    ChunkLength { chunk_type: u8, length: usize },
    #[error("Parameter of type {param_type} has an invalid length {length}")]
    ParameterLength { param_type: u16, length: usize },
    #[error("The packet holds no chunks")]
    NoChunks,
    #[error("DATA chunk with TSN {tsn} carries no user data")]
    NoUserData { tsn: u32 },
    #[error("HEARTBEAT without heartbeat information")]
    MissingHeartbeatInfo,
    #[error(
        "The computed checksum {actual:#010x} did not match the header checksum {expected:#010x}"
    )]
    Checksum { actual: u32, expected: u32 },
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, count: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        if self.bytes.len() < count {
            return Err(ParseError::Truncated(what));
        }
        let (taken, rest) = self.bytes.split_at(count);
        self.bytes = rest;
        Ok(taken)
    }

    fn skip_up_to(&mut self, count: usize) {
        let count = count.min(self.bytes.len());
        self.bytes = &self.bytes[count..];
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], ParseError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.array::<1>(what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        Ok(u16::from_be_bytes(self.array(what)?))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        Ok(u32::from_be_bytes(self.array(what)?))
    }
}

fn parse_gap_blocks(reader: &mut Reader, count: u16) -> Result<Vec<GapBlock>, ParseError> {
    (0..count)
        .map(|_| {
            Ok(GapBlock {
                start: reader.u16("gap ack block")?,
                end: reader.u16("gap ack block")?,
            })
        })
        .collect()
}

fn parse_tsns(reader: &mut Reader, count: u16) -> Result<Vec<u32>, ParseError> {
    (0..count).map(|_| reader.u32("duplicate TSN")).collect()
}

fn parse_sack_sequence(reader: &mut Reader, flags: u8) -> Result<Option<u32>, ParseError> {
    if flags & SACK_SEQUENCE_FLAG != 0 {
        Ok(Some(reader.u32("SACK sequence number")?))
    } else {
        Ok(None)
    }
}

fn parse_parameters(reader: &mut Reader) -> Result<Vec<Parameter>, ParseError> {
    let mut parameters = vec![];
    while reader.len() >= 4 {
        let param_type = reader.u16("parameter header")?;
        let length = reader.u16("parameter header")? as usize;
        if length < 4 {
            return Err(ParseError::ParameterLength { param_type, length });
        }
        let value = reader
            .take(length - 4, "parameter value")
            .map_err(|_| ParseError::ParameterLength { param_type, length })?;
        reader.skip_up_to(add_padding(length) - length);

        let mut value_reader = Reader::new(value);
        let parameter = match param_type {
            HEARTBEAT_INFO => Parameter::HeartbeatInfo(value.to_vec()),
            IPV4_ADDRESS => Parameter::Ipv4(Ipv4Addr::from(value_reader.array::<4>("IPv4 address")?)),
            IPV6_ADDRESS => {
                Parameter::Ipv6(Ipv6Addr::from(value_reader.array::<16>("IPv6 address")?))
            }
            STATE_COOKIE => Parameter::StateCookie(value.to_vec()),
            UNRECOGNIZED_PARAMETER => Parameter::UnrecognizedParameter(value.to_vec()),
            COOKIE_PRESERVATIVE => {
                Parameter::CookiePreservative(value_reader.u32("cookie preservative")?)
            }
            SUPPORTED_ADDRESS_TYPES => {
                let mut types = vec![];
                while value_reader.len() >= 2 {
                    types.push(value_reader.u16("supported address types")?);
                }
                Parameter::SupportedAddressTypes(types)
            }
            FORWARD_TSN_SUPPORTED => Parameter::ForwardTsnSupported,
            OUTGOING_SSN_RESET_REQUEST => {
                let request_sequence = value_reader.u32("reset request")?;
                let response_sequence = value_reader.u32("reset request")?;
                let last_tsn = value_reader.u32("reset request")?;
                let mut streams = vec![];
                while value_reader.len() >= 2 {
                    streams.push(value_reader.u16("reset request")?);
                }
                Parameter::OutgoingSsnResetRequest {
                    request_sequence,
                    response_sequence,
                    last_tsn,
                    streams,
                }
            }
            RECONFIG_RESPONSE => Parameter::ReconfigResponse {
                response_sequence: value_reader.u32("reconfig response")?,
                result: value_reader.u32("reconfig response")?,
            },
            _ => Parameter::Unknown {
                param_type,
                value: value.to_vec(),
            },
        };
        parameters.push(parameter);
    }
    Ok(parameters)
}

fn parse_causes(reader: &mut Reader) -> Result<Vec<ErrorCause>, ParseError> {
    let mut causes = vec![];
    while reader.len() >= 4 {
        let code = reader.u16("error cause")?;
        let length = reader.u16("error cause")? as usize;
        if length < 4 {
            return Err(ParseError::ParameterLength {
                param_type: code,
                length,
            });
        }
        let info = reader.take(length - 4, "error cause")?.to_vec();
        reader.skip_up_to(add_padding(length) - length);
        causes.push(ErrorCause { code, info });
    }
    Ok(causes)
}

fn write_chunk(out: &mut Vec<u8>, chunk_type: u8, flags: u8, body: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.extend_from_slice(&[chunk_type, flags, 0, 0]);
    body(out);
    let length = (out.len() - start) as u16;
    out[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    pad(out);
}

fn write_tlv(out: &mut Vec<u8>, tlv_type: u16, body: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.extend_from_slice(&tlv_type.to_be_bytes());
    out.extend_from_slice(&[0; 2]);
    body(out);
    let length = (out.len() - start) as u16;
    out[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    pad(out);
}

fn pad(out: &mut Vec<u8>) {
    out.resize(add_padding(out.len()), 0);
}

fn write_parameter(out: &mut Vec<u8>, parameter: &Parameter) {
    match parameter {
        Parameter::HeartbeatInfo(info) => {
            write_tlv(out, HEARTBEAT_INFO, |out| out.extend_from_slice(info))
        }
        Parameter::Ipv4(address) => {
            write_tlv(out, IPV4_ADDRESS, |out| out.extend_from_slice(&address.octets()))
        }
        Parameter::Ipv6(address) => {
            write_tlv(out, IPV6_ADDRESS, |out| out.extend_from_slice(&address.octets()))
        }
        Parameter::StateCookie(cookie) => {
            write_tlv(out, STATE_COOKIE, |out| out.extend_from_slice(cookie))
        }
        Parameter::UnrecognizedParameter(raw) => {
            write_tlv(out, UNRECOGNIZED_PARAMETER, |out| out.extend_from_slice(raw))
        }
        Parameter::CookiePreservative(increment) => write_tlv(out, COOKIE_PRESERVATIVE, |out| {
            out.extend_from_slice(&increment.to_be_bytes())
        }),
        Parameter::SupportedAddressTypes(types) => {
            write_tlv(out, SUPPORTED_ADDRESS_TYPES, |out| {
                for address_type in types.iter() {
                    out.extend_from_slice(&address_type.to_be_bytes());
                }
            })
        }
        Parameter::ForwardTsnSupported => write_tlv(out, FORWARD_TSN_SUPPORTED, |_| {}),
        Parameter::OutgoingSsnResetRequest {
            request_sequence,
            response_sequence,
            last_tsn,
            streams,
        } => write_tlv(out, OUTGOING_SSN_RESET_REQUEST, |out| {
            out.extend_from_slice(&request_sequence.to_be_bytes());
            out.extend_from_slice(&response_sequence.to_be_bytes());
            out.extend_from_slice(&last_tsn.to_be_bytes());
            for stream in streams.iter() {
                out.extend_from_slice(&stream.to_be_bytes());
            }
        }),
        Parameter::ReconfigResponse {
            response_sequence,
            result,
        } => write_tlv(out, RECONFIG_RESPONSE, |out| {
            out.extend_from_slice(&response_sequence.to_be_bytes());
            out.extend_from_slice(&result.to_be_bytes());
        }),
        Parameter::Unknown { param_type, value } => {
            write_tlv(out, *param_type, |out| out.extend_from_slice(value))
        }
    }
}

fn write_causes(out: &mut Vec<u8>, causes: &[ErrorCause]) {
    for cause in causes.iter() {
        write_tlv(out, cause.code, |out| out.extend_from_slice(&cause.info));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(add_padding(0), 0);
        assert_eq!(add_padding(1), 4);
        assert_eq!(add_padding(4), 4);
        assert_eq!(add_padding(17), 20);
    }

    #[test]
    fn parses_handwritten_data_packet() {
        let bytes = [
            0x13, 0x88, 0x13, 0x89, // ports 5000 -> 5001
            0xde, 0xad, 0xbe, 0xef, // verification tag
            0x00, 0x00, 0x00, 0x00, // checksum
            0x00, 0x03, 0x00, 0x13, // DATA, B|E, length 19
            0x00, 0x00, 0x00, 0x0a, // TSN 10
            0x00, 0x02, 0x00, 0x07, // stream 2, SSN 7
            0x00, 0x00, 0x00, 0x33, // PPID
            b'a', b'b', b'c', 0x00, // payload + padding
        ];
        let packet = Packet::from_bytes(&bytes);
        #[cfg(feature = "compute_checksum")]
        assert!(matches!(packet, Err(ParseError::Checksum { .. })));
        #[cfg(not(feature = "compute_checksum"))]
        {
            let packet = packet.unwrap();
            assert_eq!(packet.header.src_port, 5000);
            assert_eq!(packet.header.dst_port, 5001);
            assert_eq!(packet.header.verification_tag, 0xdeadbeef);
            let Chunk::Data(data) = &packet.chunks[0] else {
                panic!("expected DATA, got {:?}", packet.chunks[0]);
            };
            assert_eq!(data.tsn, 10);
            assert_eq!(data.stream, 2);
            assert_eq!(data.ssn, 7);
            assert!(data.beginning && data.ending && !data.unordered);
            assert_eq!(data.payload, b"abc");
            assert_eq!(packet.len(), bytes.len());
        }
    }

    #[test]
    fn init_with_parameters_survives_serialization() {
        let mut packet = Packet::new(1, 2, 0);
        packet.chunks.push(Chunk::Init(Init {
            initiate_tag: 0x1234,
            a_rwnd: 65536,
            outbound_streams: 17,
            inbound_streams: 17,
            initial_tsn: 99,
            parameters: vec![
                Parameter::address("10.0.0.1".parse().unwrap()),
                Parameter::address("fe80::1".parse().unwrap()),
                Parameter::SupportedAddressTypes(vec![5, 6]),
                Parameter::ForwardTsnSupported,
                Parameter::Unknown {
                    param_type: 0xC123,
                    value: vec![1, 2, 3],
                },
            ],
        }));
        let bytes = packet.serialize();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), packet.len());

        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.chunks, packet.chunks);
        let Chunk::Init(init) = &parsed.chunks[0] else {
            panic!("expected INIT");
        };
        let addresses: Vec<IpAddr> = init.addresses().collect();
        assert_eq!(addresses.len(), 2);
        assert!(init.forward_tsn_supported());
        assert_eq!(init.reportable_unknown_parameters().count(), 1);
    }

    #[test]
    fn nr_sack_layout() {
        let sack = Sack {
            cum_tsn_ack: 100,
            a_rwnd: 4000,
            gap_blocks: vec![GapBlock { start: 2, end: 3 }],
            nr_gap_blocks: Some(vec![GapBlock { start: 2, end: 3 }]),
            duplicates: vec![98],
            sequence: Some(7),
        };
        let chunk = Chunk::Sack(sack.clone());
        assert_eq!(chunk.type_id(), NR_SACK);
        let mut out = vec![];
        chunk.serialize_into(&mut out);
        assert_eq!(out.len(), NR_SACK_CHUNK_LENGTH + 4 + 4 + 4 + 4);
        assert_eq!(out.len(), chunk.padded_length());
        assert_eq!(out[0], NR_SACK);
        assert_eq!(out[1], SACK_SEQUENCE_FLAG);

        let parsed = Chunk::parse(out[0], out[1], &out[4..]).unwrap();
        assert_eq!(parsed, Chunk::Sack(sack));
    }

    #[test]
    fn unknown_chunk_type_bits() {
        let skip_and_report = UnknownChunk {
            chunk_type: 0xC1,
            flags: 0,
            value: vec![],
        };
        assert!(!skip_and_report.stops_processing());
        assert!(skip_and_report.wants_report());

        let stop = UnknownChunk {
            chunk_type: 0x21,
            flags: 0,
            value: vec![9],
        };
        assert!(stop.stops_processing());
        assert!(!stop.wants_report());
        assert_eq!(stop.raw(), vec![0x21, 0, 0, 5, 9, 0, 0, 0]);
    }

    #[test]
    fn truncated_packets_are_rejected() {
        assert_eq!(
            Packet::from_bytes(&[0; 6]),
            Err(ParseError::Truncated("common header"))
        );
        #[cfg(not(feature = "compute_checksum"))]
        {
            assert_eq!(Packet::from_bytes(&[0; 12]), Err(ParseError::NoChunks));
            let mut bad_length = vec![0; 12];
            bad_length.extend_from_slice(&[SHUTDOWN, 0, 0, 2]);
            assert_eq!(
                Packet::from_bytes(&bad_length),
                Err(ParseError::ChunkLength {
                    chunk_type: SHUTDOWN,
                    length: 2
                })
            );
        }
    }

    #[test]
    fn forward_tsn_lists_skipped_streams() {
        let chunk = Chunk::ForwardTsn(ForwardTsn {
            new_cum_tsn: 0xFFFF_FFFF,
            streams: vec![SkippedStream { stream: 1, ssn: 4 }],
        });
        let mut out = vec![];
        chunk.serialize_into(&mut out);
        assert_eq!(out.len(), FORWARD_TSN_CHUNK_LENGTH + 4);
        assert_eq!(Chunk::parse(out[0], out[1], &out[4..]).unwrap(), chunk);
    }
}
