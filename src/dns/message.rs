//! DNS wire helpers
//!
//! The forwarder needs only two things from the wire format: the first
//! question name of an inbound query, and a synthesised answer for blocked
//! names. Everything else passes through as raw bytes.

use std::net::Ipv4Addr;

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata, RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

/// TTL carried by synthesised blocked answers
pub const BLOCKED_RESPONSE_TTL: u32 = 600;

/// Extract the first question name: labels joined by `.`, lowercased, no
/// trailing dot. Returns `None` for packets that do not parse, which the
/// forwarder treats as "forward unmodified".
#[must_use]
pub fn first_query_name(packet: &[u8]) -> Option<String> {
    let message = Message::from_bytes(packet).ok()?;
    let query = message.queries().first()?;
    let mut name = query.name().to_string().to_ascii_lowercase();
    if name.ends_with('.') {
        name.pop();
    }
    Some(name)
}

/// Synthesise the reply for a blocked name.
///
/// Preserves the transaction ID and question section of the query; answers
/// with a single A record of `0.0.0.0` and a short TTL, RCODE 0.
#[must_use]
pub fn blocked_response(packet: &[u8]) -> Option<Vec<u8>> {
    let query = Message::from_bytes(packet).ok()?;
    let question = query.queries().first()?.clone();

    let mut header = Header::new();
    header.set_id(query.header().id());
    header.set_message_type(MessageType::Response);
    header.set_op_code(OpCode::Query);
    header.set_response_code(ResponseCode::NoError);
    header.set_recursion_desired(query.header().recursion_desired());
    header.set_recursion_available(true);

    let mut response = Message::new();
    response.set_header(header);
    let name = question.name().clone();
    response.add_query(question);
    response.add_answer(Record::from_rdata(
        name,
        BLOCKED_RESPONSE_TTL,
        RData::A(rdata::A(Ipv4Addr::UNSPECIFIED)),
    ));

    response.to_bytes().ok()
}

#[cfg(test)]
pub(crate) fn sample_query(id: u16, name: &str) -> Vec<u8> {
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    let mut header = Header::new();
    header.set_id(id);
    let mut message = Message::new();
    message.set_header(header);
    message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    message.to_bytes().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_query_name_lowercased_without_dot() {
        let packet = sample_query(0x1234, "Banner.ADS.Example.COM.");
        assert_eq!(
            first_query_name(&packet).as_deref(),
            Some("banner.ads.example.com")
        );
    }

    #[test]
    fn test_first_query_name_rejects_garbage() {
        assert_eq!(first_query_name(&[0x00, 0x01, 0x02]), None);
        assert_eq!(first_query_name(&[]), None);
    }

    #[test]
    fn test_blocked_response_shape() {
        let packet = sample_query(0xBEEF, "ads.example.com.");
        let reply = blocked_response(&packet).unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();

        assert_eq!(parsed.header().id(), 0xBEEF);
        assert_eq!(parsed.header().message_type(), MessageType::Response);
        assert_eq!(parsed.header().response_code(), ResponseCode::NoError);
        assert_eq!(parsed.queries().len(), 1);
        assert_eq!(
            parsed.queries()[0].name().to_string().to_ascii_lowercase(),
            "ads.example.com."
        );

        let answers = parsed.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].ttl(), BLOCKED_RESPONSE_TTL);
        match answers[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::UNSPECIFIED),
            other => panic!("expected A record, got {other:?}"),
        }
    }

    #[test]
    fn test_blocked_response_requires_parseable_query() {
        assert!(blocked_response(&[0xde, 0xad]).is_none());
    }
}
