use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;

/// 首个问题的概要，仅用于日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionSummary {
    pub tx_id: u16,
    pub qname: String,
    pub qtype: RecordType,
}

/// 只解析头部和第一个 Query，不做完整 Message 解析。
/// 解析失败返回 None，调用方照常转发原始报文。
pub fn peek_question(packet: &[u8]) -> Option<QuestionSummary> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut qname = String::new();
    let mut pos = HEADER_LEN;
    loop {
        let len = *packet.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        // Question names are never compressed in queries we care about
        if len & 0xC0 != 0 {
            return None;
        }
        let label = packet.get(pos..pos + len)?;
        if !qname.is_empty() {
            qname.push('.');
        }
        qname.extend(label.iter().map(|b| b.to_ascii_lowercase() as char));
        if qname.len() > MAX_NAME_LEN {
            return None;
        }
        pos += len;
    }

    let qtype = packet.get(pos..pos + 2)?;
    let qtype = RecordType::from(u16::from_be_bytes([qtype[0], qtype[1]]));

    Some(QuestionSummary {
        tx_id,
        qname,
        qtype,
    })
}

/// 从响应头部取 RCODE（低 4 位，忽略 EDNS 扩展位）
pub fn peek_rcode(packet: &[u8]) -> Option<ResponseCode> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some(ResponseCode::from(0, packet[3] & 0x0F))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn query_bytes(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x4242);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        message.to_vec().unwrap()
    }

    #[test]
    fn peek_question_reads_id_name_and_type() {
        let packet = query_bytes("WWW.Example.COM.", RecordType::AAAA);
        let summary = peek_question(&packet).expect("summary");
        assert_eq!(summary.tx_id, 0x4242);
        assert_eq!(summary.qname, "www.example.com");
        assert_eq!(summary.qtype, RecordType::AAAA);
    }

    #[test]
    fn peek_question_rejects_short_or_empty_packets() {
        assert!(peek_question(&[0x00, 0x01, 0x02]).is_none());
        let mut packet = query_bytes("example.com.", RecordType::A);
        // QDCOUNT = 0
        packet[4] = 0;
        packet[5] = 0;
        assert!(peek_question(&packet).is_none());
    }

    #[test]
    fn peek_question_rejects_truncated_name() {
        let packet = query_bytes("example.com.", RecordType::A);
        assert!(peek_question(&packet[..16]).is_none());
    }

    #[test]
    fn peek_rcode_reads_low_bits() {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NXDomain);
        let packet = message.to_vec().unwrap();
        assert_eq!(peek_rcode(&packet), Some(ResponseCode::NXDomain));
        assert_eq!(peek_rcode(&packet[..4]), None);
    }
}
