use thiserror::Error;

use crate::{FileInfo, MsgKind, SERVER_SENDER};

/// Fixed width of the NUL-padded sender field.
pub const SENDER_LEN: usize = 64;
/// Total header size: sender + kind + pad + length.
pub const HEADER_LEN: usize = SENDER_LEN + 4 + 4 + 8;

const KIND_OFF: usize = SENDER_LEN;
const LEN_OFF: usize = SENDER_LEN + 8;

/// A parsed frame header. `kind` is `None` when the wire discriminant is not
/// one this server knows; `raw_kind` keeps the original value for logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub sender: String,
    pub kind: Option<MsgKind>,
    pub raw_kind: u32,
    pub body_len: usize,
}

/// Result of peeking the front of a read buffer for a header.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderStatus {
    Parsed(Header),
    NeedMore,
    Invalid(InvalidFrame),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidFrame {
    #[error("declared body length {got} exceeds limit {limit}")]
    Oversize { got: u64, limit: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("body length {got} exceeds limit {limit}")]
    Oversize { got: usize, limit: usize },
}

/// Emits a well-formed frame, or fails when `body` exceeds `max_body`.
/// The sender is truncated to at most 63 bytes (on a char boundary) and
/// NUL-padded to the fixed field width.
pub fn encode(
    kind: MsgKind,
    sender: &str,
    body: &[u8],
    max_body: usize,
) -> Result<Vec<u8>, EncodeError> {
    if body.len() > max_body {
        return Err(EncodeError::Oversize { got: body.len(), limit: max_body });
    }
    Ok(frame_unchecked(kind, sender, body))
}

/// Peeks `buf` for a complete header without consuming anything.
pub fn try_parse_header(buf: &[u8], max_body: usize) -> HeaderStatus {
    if buf.len() < HEADER_LEN {
        return HeaderStatus::NeedMore;
    }

    let body_len = u64::from_le_bytes(buf[LEN_OFF..HEADER_LEN].try_into().unwrap());
    if body_len > max_body as u64 {
        return HeaderStatus::Invalid(InvalidFrame::Oversize { got: body_len, limit: max_body });
    }

    let raw_kind = u32::from_le_bytes(buf[KIND_OFF..KIND_OFF + 4].try_into().unwrap());
    let sender_field = &buf[..SENDER_LEN];
    let sender_end = sender_field.iter().position(|&b| b == 0).unwrap_or(SENDER_LEN);
    let sender = String::from_utf8_lossy(&sender_field[..sender_end]).into_owned();

    HeaderStatus::Parsed(Header {
        sender,
        kind: MsgKind::from_wire(raw_kind),
        raw_kind,
        body_len: body_len as usize,
    })
}

/// Header-only frame with an empty body (JOIN, EXIT, the auth replies,
/// PING/PING_OK).
pub fn control(kind: MsgKind, sender: &str) -> Vec<u8> {
    frame_unchecked(kind, sender, &[])
}

/// INITIAL roster snapshot: comma-joined names, sender `SERVER`.
pub fn initial(names: &[String]) -> Vec<u8> {
    frame_unchecked(MsgKind::Initial, SERVER_SENDER, names.join(",").as_bytes())
}

/// FILE_START announcement carrying the transfer's FileInfo.
pub fn file_start(sender: &str, info: &FileInfo) -> Vec<u8> {
    frame_unchecked(MsgKind::FileStart, sender, &info.to_wire())
}

/// One relayed file chunk. The relay path re-frames bytes that already
/// passed the inbound size limit, so this cannot fail.
pub fn file_data(sender: &str, chunk: &[u8]) -> Vec<u8> {
    frame_unchecked(MsgKind::FileData, sender, chunk)
}

/// FILE_END marker closing a transfer.
pub fn file_end(sender: &str) -> Vec<u8> {
    frame_unchecked(MsgKind::FileEnd, sender, &[])
}

fn frame_unchecked(kind: MsgKind, sender: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    put_sender(&mut out, sender);
    out.extend_from_slice(&(kind as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn put_sender(out: &mut Vec<u8>, sender: &str) {
    let mut end = sender.len().min(SENDER_LEN - 1);
    while !sender.is_char_boundary(end) {
        end -= 1;
    }
    out.extend_from_slice(&sender.as_bytes()[..end]);
    out.resize(out.len() + (SENDER_LEN - end), 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_BODY_LEN;

    fn parse(buf: &[u8]) -> Header {
        match try_parse_header(buf, DEFAULT_MAX_BODY_LEN) {
            HeaderStatus::Parsed(h) => h,
            other => panic!("expected parsed header, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_across_body_sizes() {
        for len in [0usize, 1, HEADER_LEN - 1, 1024 * 1024, DEFAULT_MAX_BODY_LEN] {
            let body = vec![0xA5u8; len];
            let frame = encode(MsgKind::GroupMsg, "alice", &body, DEFAULT_MAX_BODY_LEN).unwrap();
            assert_eq!(frame.len(), HEADER_LEN + len);

            let header = parse(&frame);
            assert_eq!(header.kind, Some(MsgKind::GroupMsg));
            assert_eq!(header.sender, "alice");
            assert_eq!(header.body_len, len);
            assert_eq!(&frame[HEADER_LEN..], &body[..]);
        }
    }

    #[test]
    fn encode_rejects_oversize_body() {
        let body = vec![0u8; 17];
        let err = encode(MsgKind::GroupMsg, "a", &body, 16).unwrap_err();
        assert_eq!(err, EncodeError::Oversize { got: 17, limit: 16 });
    }

    #[test]
    fn parse_needs_full_header() {
        let frame = control(MsgKind::Ping, "p");
        for cut in [0, 1, SENDER_LEN, HEADER_LEN - 1] {
            assert_eq!(try_parse_header(&frame[..cut], DEFAULT_MAX_BODY_LEN), HeaderStatus::NeedMore);
        }
    }

    #[test]
    fn parse_flags_oversize_length() {
        let mut frame = control(MsgKind::GroupMsg, "a");
        frame[LEN_OFF..HEADER_LEN].copy_from_slice(&(17u64).to_le_bytes());
        assert_eq!(
            try_parse_header(&frame, 16),
            HeaderStatus::Invalid(InvalidFrame::Oversize { got: 17, limit: 16 })
        );
    }

    #[test]
    fn unknown_kind_parses_with_raw_value() {
        let mut frame = control(MsgKind::Ping, "a");
        frame[KIND_OFF..KIND_OFF + 4].copy_from_slice(&(99u32).to_le_bytes());
        let header = parse(&frame);
        assert_eq!(header.kind, None);
        assert_eq!(header.raw_kind, 99);
    }

    #[test]
    fn pad_bytes_are_ignored_on_parse() {
        let mut frame = control(MsgKind::Join, "bob");
        frame[KIND_OFF + 4..KIND_OFF + 8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(parse(&frame).kind, Some(MsgKind::Join));
    }

    #[test]
    fn sender_is_truncated_and_nul_padded() {
        let long = "x".repeat(200);
        let frame = control(MsgKind::Join, &long);
        let header = parse(&frame);
        assert_eq!(header.sender.len(), SENDER_LEN - 1);
        assert_eq!(frame[SENDER_LEN - 1], 0);

        // Truncation never splits a multi-byte char.
        let multi = "é".repeat(40); // 80 bytes of 2-byte chars
        let header = parse(&control(MsgKind::Join, &multi));
        assert_eq!(header.sender.as_bytes().len(), 62);
        assert!(header.sender.chars().all(|c| c == 'é'));
    }

    #[test]
    fn initial_joins_names_with_commas() {
        let frame = initial(&["alice".into(), "bob".into()]);
        let header = parse(&frame);
        assert_eq!(header.kind, Some(MsgKind::Initial));
        assert_eq!(header.sender, SERVER_SENDER);
        assert_eq!(&frame[HEADER_LEN..], b"alice,bob");
    }

    #[test]
    fn file_builders_emit_expected_kinds() {
        let info = FileInfo { filename: "x.bin".into(), size: 10 };
        assert_eq!(parse(&file_start("a", &info)).kind, Some(MsgKind::FileStart));
        assert_eq!(parse(&file_data("a", b"AAAAA")).body_len, 5);
        assert_eq!(parse(&file_end("a")).body_len, 0);
    }
}
