//! DNS messages in decoded form.
//!
//! The transports hand inbound packets to [`Message::from_octets`] and get
//! back a fully decoded message: header, question section, and answer
//! section with each record's data in canonical string form. Outbound
//! queries are put together with [`QueryBuilder`]. Authority and additional
//! sections are not interesting to a stub resolver and are left unparsed.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::{error, fmt};
use bytes::Bytes;
use super::iana::{Class, Rcode, Rtype};

/// The length of a message header in octets.
const HEADER_LEN: usize = 12;

/// Upper bound on compression pointer jumps while decoding a single name.
const MAX_NAME_JUMPS: usize = 64;

//------------ Header --------------------------------------------------------

/// The header of a DNS message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    id: u16,
    flags: u16,
}

impl Header {
    /// Returns the message ID.
    pub fn id(self) -> u16 {
        self.id
    }

    /// Returns whether the message is a response.
    pub fn qr(self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Returns whether the response was truncated.
    pub fn tc(self) -> bool {
        self.flags & 0x0200 != 0
    }

    /// Returns whether recursion is desired.
    pub fn rd(self) -> bool {
        self.flags & 0x0100 != 0
    }

    /// Returns the response code.
    pub fn rcode(self) -> Rcode {
        Rcode::from_int((self.flags & 0x000F) as u8)
    }
}

//------------ Question ------------------------------------------------------

/// An entry of the question section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    qname: String,
    qtype: Rtype,
}

impl Question {
    /// Returns the queried name.
    pub fn qname(&self) -> &str {
        &self.qname
    }

    /// Returns the queried record type.
    pub fn qtype(&self) -> Rtype {
        self.qtype
    }
}

//------------ Record --------------------------------------------------------

/// An entry of the answer section.
///
/// The record data is kept in its canonical string form: dotted quad for A,
/// textual address for AAAA, a domain name for the name-carrying types, and
/// a hex string for anything else.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    owner: String,
    rtype: Rtype,
    ttl: u32,
    data: String,
}

impl Record {
    /// Returns the owner name of the record.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the record type.
    pub fn rtype(&self) -> Rtype {
        self.rtype
    }

    /// Returns the time-to-live in seconds.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Returns the record data in canonical string form.
    pub fn data(&self) -> &str {
        &self.data
    }
}

//------------ Message -------------------------------------------------------

/// A decoded DNS message.
#[derive(Clone, Debug)]
pub struct Message {
    header: Header,
    questions: Vec<Question>,
    answers: Vec<Record>,
}

impl Message {
    /// Decodes a message from its wire form.
    pub fn from_octets(octets: Bytes) -> Result<Message, ParseError> {
        let data = octets.as_ref();
        if data.len() < HEADER_LEN {
            return Err(ParseError::ShortMessage);
        }
        let header = Header {
            id: u16::from_be_bytes([data[0], data[1]]),
            flags: u16::from_be_bytes([data[2], data[3]]),
        };
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let ancount = u16::from_be_bytes([data[6], data[7]]);

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let (qname, end) = parse_name(data, pos)?;
            pos = end;
            let qtype = Rtype::from_int(read_u16(data, pos)?);
            pos += 4; // type and class
            questions.push(Question { qname, qtype });
        }

        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            let (owner, end) = parse_name(data, pos)?;
            pos = end;
            let rtype = Rtype::from_int(read_u16(data, pos)?);
            let ttl = read_u32(data, pos + 4)?;
            let rdlen = read_u16(data, pos + 8)? as usize;
            pos += 10;
            if data.len() < pos + rdlen {
                return Err(ParseError::ShortMessage);
            }
            let data_str = parse_rdata(data, pos, rdlen, rtype)?;
            pos += rdlen;
            answers.push(Record {
                owner,
                rtype,
                ttl,
                data: data_str,
            });
        }

        Ok(Message {
            header,
            questions,
            answers,
        })
    }

    /// Returns the message header.
    pub fn header(&self) -> Header {
        self.header
    }

    /// Returns the question section.
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Returns the first question if there is one.
    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// Returns the answer section.
    pub fn answers(&self) -> &[Record] {
        &self.answers
    }
}

//------------ QueryBuilder --------------------------------------------------

/// Composes a query message.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    id: u16,
    rd: bool,
    questions: Vec<(String, Rtype)>,
}

impl QueryBuilder {
    /// Creates a builder for a query with the given message ID.
    pub fn new(id: u16) -> Self {
        QueryBuilder {
            id,
            rd: false,
            questions: Vec::new(),
        }
    }

    /// Sets the recursion desired flag.
    pub fn set_rd(&mut self, rd: bool) {
        self.rd = rd;
    }

    /// Appends a question for the given name and type.
    pub fn push_question(&mut self, qname: &str, qtype: Rtype) {
        self.questions.push((qname.into(), qtype));
    }

    /// Produces the wire form of the query.
    pub fn finish(&self) -> Vec<u8> {
        let mut target = Vec::with_capacity(HEADER_LEN + 32);
        target.extend_from_slice(&self.id.to_be_bytes());
        let flags: u16 = if self.rd { 0x0100 } else { 0 };
        target.extend_from_slice(&flags.to_be_bytes());
        target.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        target.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        for (qname, qtype) in &self.questions {
            compose_name(&mut target, qname);
            target.extend_from_slice(&qtype.to_int().to_be_bytes());
            target.extend_from_slice(&Class::IN.to_int().to_be_bytes());
        }
        target
    }
}

//------------ ParseError ----------------------------------------------------

/// An error happened while decoding a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The octet sequence ended in the middle of a field.
    ShortMessage,

    /// A name's compression pointers do not terminate.
    CompressionLoop,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::ShortMessage => {
                f.write_str("octet sequence too short to be a valid message")
            }
            ParseError::CompressionLoop => {
                f.write_str("compression pointer loop in domain name")
            }
        }
    }
}

impl error::Error for ParseError {}

//------------ Helpers -------------------------------------------------------

fn read_u16(data: &[u8], pos: usize) -> Result<u16, ParseError> {
    if data.len() < pos + 2 {
        return Err(ParseError::ShortMessage);
    }
    Ok(u16::from_be_bytes([data[pos], data[pos + 1]]))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, ParseError> {
    if data.len() < pos + 4 {
        return Err(ParseError::ShortMessage);
    }
    Ok(u32::from_be_bytes([
        data[pos],
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
    ]))
}

/// Decodes a possibly compressed name starting at `pos`.
///
/// Returns the name in dotted form and the position directly behind it in
/// the original octet sequence.
fn parse_name(
    data: &[u8],
    mut pos: usize,
) -> Result<(String, usize), ParseError> {
    let mut name = String::new();
    let mut end = None;
    let mut jumps = 0;
    loop {
        let len = match data.get(pos) {
            Some(&len) => len as usize,
            None => return Err(ParseError::ShortMessage),
        };
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = match data.get(pos + 1) {
                Some(&low) => low as usize,
                None => return Err(ParseError::ShortMessage),
            };
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_NAME_JUMPS {
                return Err(ParseError::CompressionLoop);
            }
            pos = (len & 0x3F) << 8 | low;
            continue;
        }
        if data.len() < pos + 1 + len {
            return Err(ParseError::ShortMessage);
        }
        if !name.is_empty() {
            name.push('.');
        }
        for &ch in &data[pos + 1..pos + 1 + len] {
            name.push(ch as char);
        }
        pos += 1 + len;
    }
    Ok((name, end.unwrap_or(pos)))
}

/// Appends the wire form of a name in dotted form to `target`.
fn compose_name(target: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        target.push(label.len() as u8);
        target.extend_from_slice(label.as_bytes());
    }
    target.push(0);
}

/// Renders record data as its canonical string.
fn parse_rdata(
    data: &[u8],
    pos: usize,
    rdlen: usize,
    rtype: Rtype,
) -> Result<String, ParseError> {
    let rdata = &data[pos..pos + rdlen];
    match rtype {
        Rtype::A if rdlen == 4 => {
            Ok(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])
                .to_string())
        }
        Rtype::AAAA if rdlen == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ok(Ipv6Addr::from(octets).to_string())
        }
        Rtype::CNAME | Rtype::DNAME => {
            // The name may use compression pointers into the whole message.
            parse_name(data, pos).map(|(name, _)| name)
        }
        _ => {
            let mut out = String::with_capacity(rdlen * 2);
            for ch in rdata {
                out.push_str(&format!("{:02x}", ch));
            }
            Ok(out)
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn build_response(id: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x81, 0x80]); // QR, RD, RA
        buf.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
        // Question: example.com A IN
        compose_name(&mut buf, "example.com");
        buf.extend_from_slice(&[0, 1, 0, 1]);
        // Answer: pointer to offset 12, A, IN, TTL 300, 93.184.216.34
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&[0, 1, 0, 1]);
        buf.extend_from_slice(&300u32.to_be_bytes());
        buf.extend_from_slice(&[0, 4, 93, 184, 216, 34]);
        buf
    }

    #[test]
    fn decode_response() {
        let msg =
            Message::from_octets(build_response(0x1234).into()).unwrap();
        assert_eq!(msg.header().id(), 0x1234);
        assert!(msg.header().qr());
        assert!(!msg.header().tc());
        assert_eq!(msg.header().rcode(), Rcode::NOERROR);
        assert_eq!(msg.first_question().unwrap().qname(), "example.com");
        let answer = &msg.answers()[0];
        assert_eq!(answer.owner(), "example.com");
        assert_eq!(answer.rtype(), Rtype::A);
        assert_eq!(answer.ttl(), 300);
        assert_eq!(answer.data(), "93.184.216.34");
    }

    #[test]
    fn decode_compression_loop() {
        let mut data = vec![0u8; 14];
        data[4] = 0; // qdcount low stays zero
        data[6] = 0;
        let mut looped = build_response(1);
        // Rewrite the answer owner pointer to point at itself.
        let owner_at = 12 + 13 + 4;
        looped[owner_at] = 0xC0;
        looped[owner_at + 1] = owner_at as u8;
        assert_eq!(
            Message::from_octets(looped.into()).unwrap_err(),
            ParseError::CompressionLoop
        );
        assert_eq!(
            Message::from_octets(data[..8].to_vec().into()).unwrap_err(),
            ParseError::ShortMessage
        );
    }

    #[test]
    fn query_round_trip() {
        let mut builder = QueryBuilder::new(4711);
        builder.set_rd(true);
        builder.push_question("www.Example.ORG", Rtype::AAAA);
        let msg = Message::from_octets(builder.finish().into()).unwrap();
        assert_eq!(msg.header().id(), 4711);
        assert!(!msg.header().qr());
        assert!(msg.header().rd());
        let question = msg.first_question().unwrap();
        assert_eq!(question.qname(), "www.Example.ORG");
        assert_eq!(question.qtype(), Rtype::AAAA);
    }

    #[test]
    fn decode_aaaa_and_unknown_rdata() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&[0x80, 0x00]);
        buf.extend_from_slice(&[0, 0, 0, 2, 0, 0, 0, 0]);
        compose_name(&mut buf, "v6.example");
        buf.extend_from_slice(&[0, 28, 0, 1]);
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&[0, 16]);
        buf.extend_from_slice(&[0; 15]);
        buf.push(1);
        compose_name(&mut buf, "txt.example");
        buf.extend_from_slice(&[0, 16, 0, 1]);
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&[0, 2, 0xAB, 0xCD]);
        let msg = Message::from_octets(buf.into()).unwrap();
        assert_eq!(msg.answers()[0].data(), "::1");
        assert_eq!(msg.answers()[1].data(), "abcd");
    }
}
