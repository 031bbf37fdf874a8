/// Fixed width of the NUL-padded filename field.
pub const FILENAME_LEN: usize = 256;
/// FILE_START body size: filename + declared size.
pub const FILE_INFO_LEN: usize = FILENAME_LEN + 8;

/// Body of a FILE_START frame: the announced filename and the total number
/// of payload bytes the sender intends to stream in FILE_DATA chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
}

impl FileInfo {
    /// Serialises to the fixed 264-byte wire layout.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_INFO_LEN);
        let name = self.filename.as_bytes();
        let mut end = name.len().min(FILENAME_LEN - 1);
        while !self.filename.is_char_boundary(end) {
            end -= 1;
        }
        out.extend_from_slice(&name[..end]);
        out.resize(FILENAME_LEN, 0);
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Parses the front of a FILE_START body. `None` when the body is too
    /// short to carry a FileInfo.
    pub fn from_wire(body: &[u8]) -> Option<Self> {
        if body.len() < FILE_INFO_LEN {
            return None;
        }
        let name_end = body[..FILENAME_LEN].iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        let filename = String::from_utf8_lossy(&body[..name_end]).into_owned();
        let size = u64::from_le_bytes(body[FILENAME_LEN..FILE_INFO_LEN].try_into().unwrap());
        Some(Self { filename, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let info = FileInfo { filename: "report.pdf".into(), size: 123_456_789 };
        let wire = info.to_wire();
        assert_eq!(wire.len(), FILE_INFO_LEN);
        assert_eq!(FileInfo::from_wire(&wire).unwrap(), info);
    }

    #[test]
    fn short_body_is_rejected() {
        assert_eq!(FileInfo::from_wire(&[0u8; FILE_INFO_LEN - 1]), None);
    }

    #[test]
    fn long_filename_is_truncated() {
        let info = FileInfo { filename: "n".repeat(400), size: 1 };
        let parsed = FileInfo::from_wire(&info.to_wire()).unwrap();
        assert_eq!(parsed.filename.len(), FILENAME_LEN - 1);
        assert_eq!(parsed.size, 1);
    }
}
