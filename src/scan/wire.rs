//! Scan wire protocol: outgoing command encoding and incoming stream parsing.
//!
//! Framing mirrors the info protocol's 8-byte big-endian length header, but
//! the payload that follows is a sequence of record messages rather than a
//! single text blob.

use std::collections::HashMap;

use crate::error::{ClientError, Result};
use crate::scan::types::{ScanRecord, ScanRequest, TaskId};

const HEADER_LEN: usize = 8;
const VERSION: u8 = 2;
const TYPE_MESSAGE: u8 = 3;

/// Result-code/info-flag bit meaning `this is the last record message in the
/// stream`.
pub const INFO3_LAST: u8 = 0x02;
const RESULT_OK: u8 = 0;
const RESULT_NOT_FOUND: u8 = 2;

/// Command-header read/write attribute bits (second scan-options byte is the
/// percent; these ride in the reserved byte that follows it).
const EXISTS_IGNORE: u8 = 0x01;
const GEN_IGNORE: u8 = 0x02;
const COMMIT_LEVEL_ALL: u8 = 0x04;
const CONSISTENCY_LEVEL_ONE: u8 = 0x08;
const GET_NOBINDATA: u8 = 0x10;

/// Marks a background (UDF-driven) scan command; written as the op-marker
/// byte following the UDF trio.
const UDF_OP_BACKGROUND: u8 = 2;

/// Builds the outgoing scan command: namespace, optional set, scan-options
/// (`priority<<4 | fail_on_cluster_change<<3`, then percent), task id,
/// optional UDF trio plus op-marker, bin names.
pub fn encode_scan_command(
    req: &ScanRequest,
    task_id: TaskId,
    max_namespace_len: usize,
) -> Result<Vec<u8>> {
    crate::info::check_namespace_len(&req.namespace, max_namespace_len)?;

    let mut body = Vec::new();

    write_field(&mut body, FieldType::Namespace, req.namespace.as_bytes());
    if let Some(set) = &req.set_name {
        write_field(&mut body, FieldType::SetName, set.as_bytes());
    }

    let scan_options: u8 = (req.priority << 4) | if req.fail_on_cluster_change { 0x08 } else { 0 };
    body.push(scan_options);
    body.push(req.scan_pct);

    let mut attrs = CONSISTENCY_LEVEL_ONE;
    if req.udf.is_some() {
        attrs |= EXISTS_IGNORE | GEN_IGNORE | COMMIT_LEVEL_ALL;
    }
    if req.no_bins {
        attrs |= GET_NOBINDATA;
    }
    body.push(attrs);

    body.extend_from_slice(&task_id.0.to_be_bytes());

    if let Some(udf) = &req.udf {
        write_field(&mut body, FieldType::UdfPackage, udf.package_name.as_bytes());
        write_field(&mut body, FieldType::UdfFunction, udf.function_name.as_bytes());
        write_field(&mut body, FieldType::UdfArgs, &udf.args);
        body.push(UDF_OP_BACKGROUND);
    }

    for bin in &req.bin_names {
        write_field(&mut body, FieldType::BinName, bin.as_bytes());
    }

    Ok(encode_frame(&body))
}

enum FieldType {
    Namespace,
    SetName,
    UdfPackage,
    UdfFunction,
    UdfArgs,
    BinName,
}

fn write_field(out: &mut Vec<u8>, kind: FieldType, data: &[u8]) {
    let tag: u8 = match kind {
        FieldType::Namespace => 0,
        FieldType::SetName => 1,
        FieldType::UdfPackage => 2,
        FieldType::UdfFunction => 3,
        FieldType::UdfArgs => 4,
        FieldType::BinName => 5,
    };
    out.extend_from_slice(&((data.len() + 1) as u32).to_be_bytes());
    out.push(tag);
    out.extend_from_slice(data);
}

fn encode_frame(body: &[u8]) -> Vec<u8> {
    let sz = body.len() as u64 & 0x0000_FFFF_FFFF_FFFF;
    let header = sz | ((VERSION as u64) << 56) | ((TYPE_MESSAGE as u64) << 48);
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Outcome of parsing one record message from the stream.
pub enum StreamEvent {
    Record(ScanRecord),
    /// `INFO3_LAST` was set or the server replied `NOT_FOUND`: the node's
    /// contribution to this scan is complete.
    End,
}

/// Parses every record message out of one already-length-delimited frame
/// body. A frame may carry several record messages back to back.
pub fn parse_frame_body(namespace: &str, body: &[u8]) -> Result<Vec<StreamEvent>> {
    let mut events = Vec::new();
    let mut cursor = 0usize;

    while cursor < body.len() {
        if body.len() - cursor < 12 {
            return Err(ClientError::ParseError("truncated record message header".into()));
        }

        let result_code = body[cursor];
        let info_flags = body[cursor + 1];
        // byte cursor+2 reserved/unused in this wire revision.
        let generation = u32::from_be_bytes(body[cursor + 4..cursor + 8].try_into().unwrap());
        cursor += 8;

        if body.len() - cursor < 4 {
            return Err(ClientError::ParseError("truncated record message ttl fields".into()));
        }
        let _record_ttl = u32::from_be_bytes(body[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;

        if result_code == RESULT_NOT_FOUND || (info_flags & INFO3_LAST) != 0 {
            events.push(StreamEvent::End);
            break;
        }
        if result_code != RESULT_OK {
            return Err(ClientError::ServerError(result_code as i64));
        }

        if body.len() - cursor < 4 {
            return Err(ClientError::ParseError("truncated txn-ttl/field-count".into()));
        }
        let _txn_ttl = u32::from_be_bytes(body[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;

        if body.len() - cursor < 4 {
            return Err(ClientError::ParseError("truncated field-count/op-count".into()));
        }
        let field_count = u16::from_be_bytes(body[cursor..cursor + 2].try_into().unwrap());
        let op_count = u16::from_be_bytes(body[cursor + 2..cursor + 4].try_into().unwrap());
        cursor += 4;

        let mut set_name = String::new();
        for _ in 0..field_count {
            if body.len() - cursor < 5 {
                return Err(ClientError::ParseError("truncated field".into()));
            }
            let field_len = u32::from_be_bytes(body[cursor..cursor + 4].try_into().unwrap()) as usize;
            let field_tag = body[cursor + 4];
            cursor += 5;
            if body.len() - cursor < field_len.saturating_sub(1) {
                return Err(ClientError::ParseError("truncated field payload".into()));
            }
            let payload_len = field_len.saturating_sub(1);
            if field_tag == 1 {
                set_name = String::from_utf8_lossy(&body[cursor..cursor + payload_len]).into_owned();
            }
            cursor += payload_len;
        }

        let mut bins = HashMap::new();
        for _ in 0..op_count {
            if body.len() - cursor < 8 {
                return Err(ClientError::ParseError("truncated op".into()));
            }
            let op_len = u32::from_be_bytes(body[cursor..cursor + 4].try_into().unwrap()) as usize;
            // op-type byte + particle-type byte + version byte + name-len byte
            let name_len = body[cursor + 7] as usize;
            cursor += 8;
            if body.len() - cursor < name_len {
                return Err(ClientError::ParseError("truncated op name".into()));
            }
            let name = String::from_utf8_lossy(&body[cursor..cursor + name_len]).into_owned();
            cursor += name_len;

            let value_len = op_len.saturating_sub(4 + name_len);
            if body.len() - cursor < value_len {
                return Err(ClientError::ParseError("truncated op value".into()));
            }
            let value = body[cursor..cursor + value_len].to_vec();
            cursor += value_len;
            bins.insert(name, value);
        }

        events.push(StreamEvent::Record(ScanRecord {
            namespace: namespace.to_string(),
            set_name,
            generation,
            bins,
        }));
    }

    Ok(events)
}

/// Reads the 8-byte frame header and returns the payload length it declares.
pub fn decode_frame_header(header: &[u8; HEADER_LEN]) -> usize {
    let sized = u64::from_be_bytes(*header);
    (sized & 0x0000_FFFF_FFFF_FFFF) as usize
}

pub const fn header_len() -> usize {
    HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::types::UdfCall;

    #[test]
    fn encode_scan_command_includes_namespace_and_task_id() {
        let req = ScanRequest {
            namespace: "test".into(),
            ..Default::default()
        };
        let frame = encode_scan_command(&req, TaskId(42), 30).unwrap();
        let len = decode_frame_header(&frame[..HEADER_LEN].try_into().unwrap());
        assert_eq!(len, frame.len() - HEADER_LEN);
        assert!(frame.windows(4).any(|w| w == b"test"));
    }

    #[test]
    fn encode_scan_command_with_udf_includes_trio() {
        let req = ScanRequest {
            namespace: "test".into(),
            udf: Some(UdfCall {
                package_name: "pkg".into(),
                function_name: "fn".into(),
                args: vec![1, 2, 3],
            }),
            ..Default::default()
        };
        let frame = encode_scan_command(&req, TaskId::random(), 30).unwrap();
        assert!(frame.windows(3).any(|w| w == b"pkg"));
    }

    fn record_message(result_code: u8, info_flags: u8, generation: u32) -> Vec<u8> {
        let mut m = Vec::new();
        m.push(result_code);
        m.push(info_flags);
        m.push(0);
        m.push(0);
        m.extend_from_slice(&generation.to_be_bytes());
        m.extend_from_slice(&0u32.to_be_bytes()); // record-ttl
        m.extend_from_slice(&0u32.to_be_bytes()); // txn-ttl
        m.extend_from_slice(&0u16.to_be_bytes()); // field-count
        m.extend_from_slice(&0u16.to_be_bytes()); // op-count
        m
    }

    #[test]
    fn parse_frame_body_recognizes_last_record() {
        let body = record_message(RESULT_OK, INFO3_LAST, 7);
        let events = parse_frame_body("test", &body).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::End));
    }

    #[test]
    fn parse_frame_body_recognizes_not_found_as_end() {
        let body = record_message(RESULT_NOT_FOUND, 0, 0);
        let events = parse_frame_body("test", &body).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::End));
    }

    #[test]
    fn parse_frame_body_parses_plain_record() {
        let body = record_message(RESULT_OK, 0, 3);
        let events = parse_frame_body("test", &body).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Record(rec) => assert_eq!(rec.generation, 3),
            StreamEvent::End => panic!("expected a record"),
        }
    }
}
