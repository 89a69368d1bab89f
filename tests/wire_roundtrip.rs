use fake::{Fake, Faker};

use relayed::protocol::deserialise::ConsumableBuffer;
use relayed::protocol::serialise::WritableBuffer;
use relayed::protocol::wire_types::*;

#[test]
fn roundtrip_message() {
    for _ in 0..100 {
        let original = arbitrary_message();
        let deserialised = Message::from_octets(&original.to_octets().unwrap());

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_header() {
    for _ in 0..100 {
        let original = arbitrary_wire_header();

        let mut buffer = WritableBuffer::default();
        original.header.serialise(&mut buffer);
        buffer.write_u16(original.qdcount);
        buffer.write_u16(original.ancount);
        buffer.write_u16(original.nscount);
        buffer.write_u16(original.arcount);
        let deserialised = WireHeader::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_question() {
    for _ in 0..100 {
        let original = arbitrary_question();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer);
        let deserialised = Question::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_resourcerecord() {
    for _ in 0..100 {
        let original = arbitrary_resourcerecord();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer).unwrap();
        let deserialised = ResourceRecord::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_domainname() {
    for _ in 0..100 {
        let original = arbitrary_domainname();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer);
        let deserialised = DomainName::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

/// An answer whose NAME is a compression pointer to the question's
/// QNAME decodes to the full dotted name, and re-encoding
/// (uncompressed) produces a buffer that decodes to the identical
/// logical message.
#[test]
fn compressed_answer_roundtrips_through_reencode() {
    let mut compressed = vec![
        0x13, 0x37, // ID
        0b1000_0000, 0, // QR, no error
        0, 1, // QDCOUNT
        0, 1, // ANCOUNT
        0, 0, // NSCOUNT
        0, 0, // ARCOUNT
    ];
    // QNAME at offset 12
    compressed.extend_from_slice(&[3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
    compressed.extend_from_slice(&[3, b'o', b'r', b'g', 0]);
    compressed.extend_from_slice(&[0, 1, 0, 1]); // QTYPE A, QCLASS IN
    compressed.extend_from_slice(&[0b1100_0000, 12]); // NAME: pointer to QNAME
    compressed.extend_from_slice(&[0, 1, 0, 1]); // TYPE A, CLASS IN
    compressed.extend_from_slice(&[0, 0, 1, 44]); // TTL 300
    compressed.extend_from_slice(&[0, 4, 1, 2, 3, 4]); // RDLENGTH, RDATA

    let decoded = Message::from_octets(&compressed).unwrap();
    assert_eq!(
        "www.example.org.",
        decoded.answers[0].name.to_dotted_string()
    );
    assert_eq!(decoded.questions[0].name, decoded.answers[0].name);

    let reencoded = decoded.to_octets().unwrap();
    // uncompressed output is longer than the compressed input
    assert!(reencoded.len() > compressed.len());
    assert_eq!(Ok(decoded), Message::from_octets(&reencoded));
}

fn arbitrary_message() -> Message {
    Message {
        header: arbitrary_header(),
        questions: arbitrary_section(arbitrary_question),
        answers: arbitrary_section(arbitrary_resourcerecord),
        authority: arbitrary_section(arbitrary_resourcerecord),
        additional: arbitrary_section(arbitrary_resourcerecord),
    }
}

fn arbitrary_section<T>(generate: fn() -> T) -> Vec<T> {
    let len = (0..4).fake::<usize>();
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(generate());
    }
    out
}

fn arbitrary_header() -> Header {
    Header {
        id: Faker.fake(),
        is_response: Faker.fake(),
        opcode: arbitrary_opcode(),
        is_authoritative: Faker.fake(),
        is_truncated: Faker.fake(),
        recursion_desired: Faker.fake(),
        recursion_available: Faker.fake(),
        rcode: arbitrary_rcode(),
    }
}

fn arbitrary_wire_header() -> WireHeader {
    WireHeader {
        header: arbitrary_header(),
        qdcount: Faker.fake(),
        ancount: Faker.fake(),
        nscount: Faker.fake(),
        arcount: Faker.fake(),
    }
}

fn arbitrary_question() -> Question {
    Question {
        name: arbitrary_domainname(),
        qtype: Faker.fake::<u16>().into(),
        qclass: Faker.fake::<u16>().into(),
    }
}

fn arbitrary_resourcerecord() -> ResourceRecord {
    ResourceRecord {
        name: arbitrary_domainname(),
        rtype_with_data: arbitrary_recordtypewithdata(),
        rclass: Faker.fake::<u16>().into(),
        ttl: Faker.fake(),
    }
}

fn arbitrary_recordtypewithdata() -> RecordTypeWithData {
    // this should match the `RecordTypeWithData` deserialisation
    match Faker.fake::<u16>().into() {
        RecordType::A => RecordTypeWithData::A {
            address: Faker.fake::<u32>().into(),
        },
        RecordType::NS => RecordTypeWithData::NS {
            nsdname: arbitrary_domainname(),
        },
        RecordType::CNAME => RecordTypeWithData::CNAME {
            cname: arbitrary_domainname(),
        },
        RecordType::SOA => RecordTypeWithData::SOA {
            mname: arbitrary_domainname(),
            rname: arbitrary_domainname(),
            serial: Faker.fake(),
            refresh: Faker.fake(),
            retry: Faker.fake(),
            expire: Faker.fake(),
            minimum: Faker.fake(),
        },
        RecordType::MX => RecordTypeWithData::MX {
            preference: Faker.fake(),
            exchange: arbitrary_domainname(),
        },
        RecordType::AAAA => RecordTypeWithData::AAAA {
            address: Faker.fake::<u128>().into(),
        },
        RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
            tag,
            octets: arbitrary_octets((0..64).fake()),
        },
    }
}

fn arbitrary_domainname() -> DomainName {
    let num_labels = (1..5).fake::<usize>();
    let mut labels = Vec::<Vec<u8>>::new();
    let mut octets = Vec::<u8>::new();

    for _ in 0..num_labels {
        let label_len = (1..20).fake::<u8>();
        let mut label = Vec::with_capacity(label_len as usize);
        octets.push(label_len);

        for _ in 0..label_len {
            let octet = Faker.fake::<u8>().to_ascii_lowercase() % 128;
            label.push(octet);
            octets.push(octet);
        }

        labels.push(label);
    }

    labels.push(Vec::new());
    octets.push(0);

    DomainName { labels, octets }
}

fn arbitrary_opcode() -> Opcode {
    // opcode is a 4-bit field
    (Faker.fake::<u8>() & 0b0000_1111).into()
}

fn arbitrary_rcode() -> Rcode {
    // rcode is a 4-bit field
    (Faker.fake::<u8>() & 0b0000_1111).into()
}

fn arbitrary_octets(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(Faker.fake());
    }
    out
}
