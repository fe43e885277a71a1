//! Minimal DNS wire codec
//!
//! Parses just enough of RFC 1035 to serve and inspect queries: the
//! header, the question section, and A/AAAA answer records. Everything
//! is big-endian on the wire.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{ReplayError, Result};

/// A record type
pub const TYPE_A: u16 = 1;
/// AAAA record type
pub const TYPE_AAAA: u16 = 28;
/// IN class
pub const CLASS_IN: u16 = 1;

/// Header flag: response
pub const FLAG_RESPONSE: u16 = 0x8000;
/// Header flag: recursion desired
pub const FLAG_RECURSION_DESIRED: u16 = 0x0100;
/// Header flag: recursion available
pub const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;

/// RCODE: server failure
pub const RCODE_SERVFAIL: u16 = 2;

const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 8;

/// A question section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Queried name, lowercase, without trailing dot
    pub name: String,
    /// Query type
    pub qtype: u16,
    /// Query class
    pub qclass: u16,
}

/// An answer section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Owner name
    pub name: String,
    /// Record type
    pub rtype: u16,
    /// Record class
    pub class: u16,
    /// Time to live in seconds
    pub ttl: u32,
    /// Raw RDATA bytes
    pub rdata: Vec<u8>,
}

impl Answer {
    /// Decode the RDATA as an address, for A and AAAA records
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match (self.rtype, self.rdata.len()) {
            (TYPE_A, 4) => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.rdata);
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.rdata);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

/// A parsed DNS message (header, questions, answers)
#[derive(Debug, Clone)]
pub struct Message {
    /// Transaction id
    pub id: u16,
    /// Header flags
    pub flags: u16,
    /// Question section
    pub questions: Vec<Question>,
    /// Answer section
    pub answers: Vec<Answer>,
}

impl Message {
    /// Parse a message from wire bytes
    ///
    /// Authority and additional sections are not materialised; the codec
    /// stops after the answer section.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Dns`] on malformed packets
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ReplayError::Dns("packet shorter than header".to_string()));
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        let ancount = u16::from_be_bytes([buf[6], buf[7]]);

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let (name, next) = read_name(buf, pos)?;
            if next + 4 > buf.len() {
                return Err(ReplayError::Dns("truncated question".to_string()));
            }
            let qtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
            let qclass = u16::from_be_bytes([buf[next + 2], buf[next + 3]]);
            questions.push(Question { name, qtype, qclass });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            let (name, next) = read_name(buf, pos)?;
            if next + 10 > buf.len() {
                return Err(ReplayError::Dns("truncated answer".to_string()));
            }
            let rtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
            let class = u16::from_be_bytes([buf[next + 2], buf[next + 3]]);
            let ttl = u32::from_be_bytes([
                buf[next + 4],
                buf[next + 5],
                buf[next + 6],
                buf[next + 7],
            ]);
            let rdlength = u16::from_be_bytes([buf[next + 8], buf[next + 9]]) as usize;
            let rdata_start = next + 10;
            if rdata_start + rdlength > buf.len() {
                return Err(ReplayError::Dns("truncated RDATA".to_string()));
            }
            answers.push(Answer {
                name,
                rtype,
                class,
                ttl,
                rdata: buf[rdata_start..rdata_start + rdlength].to_vec(),
            });
            pos = rdata_start + rdlength;
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
        })
    }

    /// First question of the message, if any
    #[must_use]
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// Build an answer to `query` carrying the given addresses
///
/// Echoes the question, sets the response and recursion bits, and emits
/// one A or AAAA record per address. Names are encoded uncompressed.
#[must_use]
pub fn build_answer(query: &Message, addresses: &[IpAddr], ttl: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    let flags =
        FLAG_RESPONSE | (query.flags & FLAG_RECURSION_DESIRED) | FLAG_RECURSION_AVAILABLE;
    write_header(
        &mut out,
        query.id,
        flags,
        query.questions.len() as u16,
        addresses.len() as u16,
    );
    for question in &query.questions {
        write_question(&mut out, question);
    }
    let name = query.question().map_or("", |q| q.name.as_str());
    for address in addresses {
        write_name(&mut out, name);
        match address {
            IpAddr::V4(v4) => {
                out.extend_from_slice(&TYPE_A.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&ttl.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&ttl.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&v6.octets());
            }
        }
    }
    out
}

/// Build a SERVFAIL response to `query`
#[must_use]
pub fn build_servfail(query: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    let flags = FLAG_RESPONSE | (query.flags & FLAG_RECURSION_DESIRED) | RCODE_SERVFAIL;
    write_header(&mut out, query.id, flags, query.questions.len() as u16, 0);
    for question in &query.questions {
        write_question(&mut out, question);
    }
    out
}

/// Build a header-only SERVFAIL echoing the id of a raw (possibly
/// unparseable) query
#[must_use]
pub fn build_servfail_raw(raw: &[u8]) -> Vec<u8> {
    let id = if raw.len() >= 2 {
        u16::from_be_bytes([raw[0], raw[1]])
    } else {
        0
    };
    let mut out = Vec::with_capacity(HEADER_LEN);
    write_header(&mut out, id, FLAG_RESPONSE | RCODE_SERVFAIL, 0, 0);
    out
}

/// Build a query for `name` with the given record type
#[must_use]
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    write_header(&mut out, id, FLAG_RECURSION_DESIRED, 1, 0);
    write_question(
        &mut out,
        &Question {
            name: name.to_string(),
            qtype,
            qclass: CLASS_IN,
        },
    );
    out
}

fn write_header(out: &mut Vec<u8>, id: u16, flags: u16, qdcount: u16, ancount: u16) {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
}

fn write_question(out: &mut Vec<u8>, question: &Question) {
    write_name(out, &question.name);
    out.extend_from_slice(&question.qtype.to_be_bytes());
    out.extend_from_slice(&question.qclass.to_be_bytes());
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Read a possibly-compressed name starting at `pos`; returns the name
/// and the position just past it in the original stream
fn read_name(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut after_pointer: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *buf
            .get(cursor)
            .ok_or_else(|| ReplayError::Dns("truncated name".to_string()))?
            as usize;

        if len & 0xc0 == 0xc0 {
            if jumps >= MAX_POINTER_JUMPS {
                return Err(ReplayError::Dns("compression pointer loop".to_string()));
            }
            let next = *buf
                .get(cursor + 1)
                .ok_or_else(|| ReplayError::Dns("truncated pointer".to_string()))?
                as usize;
            if after_pointer.is_none() {
                after_pointer = Some(cursor + 2);
            }
            cursor = ((len & 0x3f) << 8) | next;
            jumps += 1;
            continue;
        }

        if len == 0 {
            cursor += 1;
            break;
        }

        if cursor + 1 + len > buf.len() {
            return Err(ReplayError::Dns("truncated label".to_string()));
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&buf[cursor + 1..cursor + 1 + len]));
        cursor += 1 + len;
    }

    Ok((name.to_lowercase(), after_pointer.unwrap_or(cursor)))
}
