//! DNS wire format
//!
//! Just enough of RFC 1035 for the tunnel resolver: build a single-question
//! A query with recursion desired, and decode a response's answer section
//! (following name-compression pointers).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use super::DnsError;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_TC: u16 = 0x0200;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
/// Upper bound on compression pointer hops within one name
const MAX_POINTER_HOPS: usize = 64;

/// Encode a query for the A record of `hostname`
pub fn build_query(id: u16, hostname: &str) -> Result<Vec<u8>, DnsError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + hostname.len() + 6);

    buf.put_u16(id);
    buf.put_u16(FLAG_RD);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(0); // ARCOUNT

    write_name(&mut buf, hostname)?;
    buf.put_u16(TYPE_A);
    buf.put_u16(CLASS_IN);

    Ok(buf.to_vec())
}

fn write_name(buf: &mut BytesMut, hostname: &str) -> Result<(), DnsError> {
    let name = hostname.strip_suffix('.').unwrap_or(hostname);
    if name.is_empty() || name.len() > MAX_NAME_LEN - 2 {
        return Err(DnsError::InvalidName(hostname.to_string()));
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidName(hostname.to_string()));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// One resource record from the answer section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    /// Set for A and AAAA records
    pub address: Option<IpAddr>,
    /// Set for CNAME records
    pub cname: Option<String>,
}

/// Decoded DNS response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub rcode: u8,
    pub truncated: bool,
    pub answers: Vec<DnsAnswer>,
}

impl DnsResponse {
    /// Decode a response message (without the TCP length prefix)
    pub fn parse(msg: &[u8]) -> Result<Self, DnsError> {
        if msg.len() < HEADER_LEN {
            return Err(DnsError::Malformed("message shorter than header".into()));
        }

        let mut buf = msg;
        let id = buf.get_u16();
        let flags = buf.get_u16();
        let qdcount = buf.get_u16();
        let ancount = buf.get_u16();
        let _nscount = buf.get_u16();
        let _arcount = buf.get_u16();

        if flags & FLAG_QR == 0 {
            return Err(DnsError::Malformed("message is a query, not a response".into()));
        }

        for _ in 0..qdcount {
            read_name(msg, &mut buf)?;
            skip(&mut buf, 4)?; // QTYPE + QCLASS
        }

        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            answers.push(read_record(msg, &mut buf)?);
        }

        Ok(Self {
            id,
            rcode: (flags & 0x000F) as u8,
            truncated: flags & FLAG_TC != 0,
            answers,
        })
    }

    /// First answer that carries an address
    pub fn first_address(&self) -> Option<IpAddr> {
        self.answers.iter().find_map(|a| a.address)
    }
}

fn read_record<'a>(msg: &'a [u8], buf: &mut &'a [u8]) -> Result<DnsAnswer, DnsError> {
    let name = read_name(msg, buf)?;
    need(buf, 10)?;
    let rtype = buf.get_u16();
    let class = buf.get_u16();
    let ttl = buf.get_u32();
    let rdlength = buf.get_u16() as usize;
    need(buf, rdlength)?;

    let rest: &'a [u8] = *buf;
    let rdata = &rest[..rdlength];
    let mut address = None;
    let mut cname = None;
    match (rtype, rdlength) {
        (TYPE_A, 4) => {
            address = Some(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
        }
        (TYPE_AAAA, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            address = Some(IpAddr::V6(Ipv6Addr::from(octets)));
        }
        (TYPE_CNAME, _) => {
            let mut cursor = rdata;
            cname = Some(read_name(msg, &mut cursor)?);
        }
        _ => {}
    }
    buf.advance(rdlength);

    Ok(DnsAnswer {
        name,
        rtype,
        class,
        ttl,
        address,
        cname,
    })
}

/// Read a possibly-compressed name. `buf` must be a suffix of `msg`; it is
/// advanced past the name as it appears at the current position.
fn read_name<'a>(msg: &'a [u8], buf: &mut &'a [u8]) -> Result<String, DnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = *buf;
    let mut jumped = false;
    let mut hops = 0;

    loop {
        need(&cursor, 1)?;
        let len = cursor[0];
        match len & 0xC0 {
            0x00 => {
                cursor.advance(1);
                if len == 0 {
                    break;
                }
                let len = len as usize;
                need(&cursor, len)?;
                labels.push(String::from_utf8_lossy(&cursor[..len]).into_owned());
                cursor.advance(len);
            }
            0xC0 => {
                need(&cursor, 2)?;
                let offset = (cursor.get_u16() & 0x3FFF) as usize;
                if !jumped {
                    *buf = cursor;
                    jumped = true;
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS || offset >= msg.len() {
                    return Err(DnsError::Malformed("bad compression pointer".into()));
                }
                cursor = &msg[offset..];
            }
            _ => return Err(DnsError::Malformed("unsupported label type".into())),
        }
    }

    if !jumped {
        *buf = cursor;
    }
    Ok(labels.join("."))
}

fn need(buf: &&[u8], n: usize) -> Result<(), DnsError> {
    if buf.remaining() < n {
        Err(DnsError::Malformed("unexpected end of message".into()))
    } else {
        Ok(())
    }
}

fn skip(buf: &mut &[u8], n: usize) -> Result<(), DnsError> {
    need(buf, n)?;
    buf.advance(n);
    Ok(())
}
