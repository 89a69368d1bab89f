//! Deserialisation of DNS messages from the network.  See the
//! `wire_types` module for details of the format.
//!
//! The relay never answers a malformed datagram (it logs and drops
//! it), so unlike a full server the errors here do not carry the
//! transaction id of the offending message.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::wire_types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort)?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort)?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let qtype = buffer
            .next_u16()
            .map(QueryType::from)
            .ok_or(Error::QuestionTooShort)?;
        let qclass = buffer
            .next_u16()
            .map(QueryClass::from)
            .ok_or(Error::QuestionTooShort)?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let rtype = buffer
            .next_u16()
            .map(RecordType::from)
            .ok_or(Error::ResourceRecordTooShort)?;
        let rclass = buffer
            .next_u16()
            .map(RecordClass::from)
            .ok_or(Error::ResourceRecordTooShort)?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?;

        let rdata_start = buffer.position;

        // name-bearing RDATA is deserialised through the buffer so
        // that compression pointers expand; everything else is taken
        // raw.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(
                    buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
                ),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(buffer)?,
                rname: DomainName::deserialise(buffer)?,
                serial: buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
                refresh: buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
                retry: buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
                expire: buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
                minimum: buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?,
                exchange: DomainName::deserialise(buffer)?,
            },
            RecordType::AAAA => {
                let octets: [u8; 16] = buffer
                    .take(16)
                    .ok_or(Error::ResourceRecordTooShort)?
                    .try_into()
                    .map_err(|_| Error::ResourceRecordTooShort)?;
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(octets),
                }
            }
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: buffer
                    .take(rdlength as usize)
                    .ok_or(Error::ResourceRecordTooShort)?
                    .to_vec(),
            },
        };

        // uncompressed typed RDATA must consume exactly RDLENGTH
        // octets; compressed names consume less on the wire than they
        // expand to, so only the wire consumption is checked.
        if buffer.position != rdata_start + (rdlength as usize) {
            return Err(Error::ResourceRecordInvalid);
        }

        Ok(Self {
            name,
            rtype_with_data,
            rclass,
            ttl,
        })
    }
}

impl DomainName {
    /// Decode a (possibly compressed) name.  The buffer's position
    /// advances past the name as it appears at the current offset;
    /// pointer targets are parsed through a secondary cursor.
    ///
    /// # Errors
    ///
    /// If the name is truncated, too long, contains an invalid label,
    /// or contains a pointer to anywhere other than a strictly
    /// earlier offset.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);
        let mut labels = Vec::<Vec<u8>>::with_capacity(5);
        let start = buffer.position;

        'outer: loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort)?;

            if usize::from(size) <= LABEL_MAX_LEN {
                octets.push(size);

                if size == 0 {
                    labels.push(Vec::new());
                    break 'outer;
                }

                if let Some(os) = buffer.take(size as usize) {
                    octets.extend_from_slice(os);
                    labels.push(os.to_vec());
                } else {
                    return Err(Error::DomainTooShort);
                }

                if octets.len() > DOMAINNAME_MAX_LEN {
                    break 'outer;
                }
            } else if size >= 0b1100_0000 {
                // RFC 1035 section 4.1.4: a pointer may only target an
                // earlier occurrence of a name.  Forward and self
                // references are rejected, which also bounds the
                // recursion: each jump goes strictly backwards.
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort)?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                if ptr >= start {
                    return Err(Error::DomainPointerInvalid);
                }

                let mut other = DomainName::deserialise(&mut buffer.at_offset(ptr))?;
                octets.append(&mut other.octets);
                labels.append(&mut other.labels);
                break 'outer;
            } else {
                return Err(Error::DomainLabelInvalid);
            }
        }

        if octets.len() <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { octets, labels })
        } else {
            Err(Error::DomainTooLong)
        }
    }
}

/// Errors encountered when parsing a datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The header is missing one or more required fields.
    HeaderTooShort,

    /// A question ends with an incomplete field.
    QuestionTooShort,

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort,

    /// A resource record's RDATA does not span exactly RDLENGTH
    /// octets.
    ResourceRecordInvalid,

    /// A domain is incomplete.
    DomainTooShort,

    /// A domain is over 255 octets in size.
    DomainTooLong,

    /// A domain pointer points to or after the current name.
    DomainPointerInvalid,

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::HeaderTooShort => write!(f, "header too short"),
            Error::QuestionTooShort => write!(f, "question too short"),
            Error::ResourceRecordTooShort => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid => write!(f, "resource record rdata length mismatch"),
            Error::DomainTooShort => write!(f, "domain name truncated"),
            Error::DomainTooLong => write!(f, "domain name over 255 octets"),
            Error::DomainPointerInvalid => write!(f, "domain pointer not strictly backwards"),
            Error::DomainLabelInvalid => write!(f, "domain label over 63 octets"),
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    pub position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    #[test]
    fn deserialise_normal_name() {
        let buf = [3, b'w', b'w', b'w', 3, b'c', b'o', b'm', 0];
        let name = DomainName::deserialise(&mut ConsumableBuffer::new(&buf)).unwrap();
        assert_eq!(domain("www.com."), name);
    }

    #[test]
    fn deserialise_compressed_name() {
        // "com." at offset 0, "www" + pointer to 0 at offset 5
        let buf = [
            3, b'c', b'o', b'm', 0, 3, b'w', b'w', b'w', 0b1100_0000, 0,
        ];
        let mut buffer = ConsumableBuffer::new(&buf);
        buffer.position = 5;
        let name = DomainName::deserialise(&mut buffer).unwrap();
        assert_eq!(domain("www.com."), name);
        // the cursor advances past the pointer, not to the target
        assert_eq!(11, buffer.position);
    }

    #[test]
    fn deserialise_rejects_self_pointer() {
        let buf = [3, b'w', b'w', b'w', 0b1100_0000, 4];
        let mut buffer = ConsumableBuffer::new(&buf);
        assert_eq!(
            Err(Error::DomainPointerInvalid),
            DomainName::deserialise(&mut buffer)
        );
    }

    #[test]
    fn deserialise_rejects_forward_pointer() {
        let buf = [0b1100_0000, 2, 3, b'w', b'w', b'w', 0];
        let mut buffer = ConsumableBuffer::new(&buf);
        assert_eq!(
            Err(Error::DomainPointerInvalid),
            DomainName::deserialise(&mut buffer)
        );
    }

    #[test]
    fn deserialise_rejects_pointer_cycle() {
        // two names pointing at each other: the second's pointer is
        // legal (backwards), the first's pointer is a forward
        // reference and caught.
        let buf = [0b1100_0000, 2, 0b1100_0000, 0];
        let mut buffer = ConsumableBuffer::new(&buf);
        buffer.position = 2;
        assert_eq!(
            Err(Error::DomainPointerInvalid),
            DomainName::deserialise(&mut buffer)
        );
    }

    #[test]
    fn deserialise_rejects_truncated_name() {
        let buf = [3, b'w', b'w'];
        assert_eq!(
            Err(Error::DomainTooShort),
            DomainName::deserialise(&mut ConsumableBuffer::new(&buf))
        );
    }

    #[test]
    fn deserialise_rejects_unterminated_name() {
        let mut buf = Vec::new();
        for _ in 0..50 {
            buf.extend_from_slice(&[5, b'a', b'b', b'c', b'd', b'e']);
        }
        assert_eq!(
            Err(Error::DomainTooLong),
            DomainName::deserialise(&mut ConsumableBuffer::new(&buf))
        );
    }

    #[test]
    fn deserialise_rejects_invalid_label_length() {
        let buf = [0b1000_0000, b'w', 0];
        assert_eq!(
            Err(Error::DomainLabelInvalid),
            DomainName::deserialise(&mut ConsumableBuffer::new(&buf))
        );
    }

    #[test]
    fn deserialise_rejects_short_header() {
        assert_eq!(
            Err(Error::HeaderTooShort),
            Message::from_octets(&[0, 1, 0b1000_0000])
        );
    }

    #[test]
    fn deserialise_rejects_counts_past_end() {
        // a header promising one question, with no question bytes
        let buf = [0x12, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        assert_eq!(Err(Error::DomainTooShort), Message::from_octets(&buf));
    }

    #[test]
    fn deserialise_rejects_rdlength_mismatch() {
        let mut buf = vec![0x12, 0x34, 0x80, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        buf.extend_from_slice(&[3, b'w', b'w', b'w', 0]); // NAME
        buf.extend_from_slice(&[0, 1]); // TYPE A
        buf.extend_from_slice(&[0, 1]); // CLASS IN
        buf.extend_from_slice(&[0, 0, 1, 44]); // TTL
        buf.extend_from_slice(&[0, 6]); // RDLENGTH: 6, but A rdata is 4
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            Err(Error::ResourceRecordInvalid),
            Message::from_octets(&buf)
        );
    }

    #[test]
    fn deserialise_expands_compressed_rdata_name() {
        // question for www.com. A IN, answer CNAME whose rdata points
        // back into the question name.
        let mut buf = vec![0xab, 0xcd, 0x80, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        buf.extend_from_slice(&[3, b'w', b'w', b'w', 3, b'c', b'o', b'm', 0]); // QNAME at offset 12
        buf.extend_from_slice(&[0, 1, 0, 1]); // QTYPE, QCLASS
        buf.extend_from_slice(&[0b1100_0000, 12]); // NAME: pointer to QNAME
        buf.extend_from_slice(&[0, 5]); // TYPE CNAME
        buf.extend_from_slice(&[0, 1]); // CLASS IN
        buf.extend_from_slice(&[0, 0, 0, 60]); // TTL
        buf.extend_from_slice(&[0, 2]); // RDLENGTH
        buf.extend_from_slice(&[0b1100_0000, 16]); // pointer to "com."

        let message = Message::from_octets(&buf).unwrap();
        assert_eq!(domain("www.com."), message.answers[0].name);
        assert_eq!(
            RecordTypeWithData::CNAME {
                cname: domain("com.")
            },
            message.answers[0].rtype_with_data
        );
    }
}
