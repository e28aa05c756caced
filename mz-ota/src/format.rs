// MZ5 archive wire format - shared between the update engine and ota-tool

/// Fixed erase/write unit of the target flash. Every structure in the
/// archive is carried in blocks of this size, and every target's content
/// length must be a multiple of it.
pub const BLOCK_SIZE: usize = 4096;

/// 32-byte version-stamped magic that must open every archive.
pub const ARCHIVE_MAGIC: [u8; 32] = *b"MZ5 firmware archive 1.0\r\n\n\x1a    ";

/// Marker that opens every target header block.
pub const BOUNDARY_MARKER: [u8; 16] = *b"-file boundary--";

/// Width of the NUL-padded label field in a target header.
pub const LABEL_LEN: usize = 16;

/// Kind of storage region a target addresses, resolved from the header
/// label. Anything the resolver does not know is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Executable firmware image. The only kind that gets activated.
    Code,
    /// SPIFFS data filesystem image.
    Filesystem,
    /// Font/glyph asset partition for the LED matrix.
    FontAsset,
}

impl TargetKind {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "app" => Some(TargetKind::Code),
            "spiffs" => Some(TargetKind::Filesystem),
            "font" => Some(TargetKind::FontAsset),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TargetKind::Code => "app",
            TargetKind::Filesystem => "spiffs",
            TargetKind::FontAsset => "font",
        }
    }

    pub fn is_executable(self) -> bool {
        matches!(self, TargetKind::Code)
    }
}

/// Per-target record that follows the boundary marker inside a header
/// block. All integers little-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHeader {
    /// NUL-padded label; forcibly NUL-terminated on read.
    pub label: [u8; LABEL_LEN],
    /// Pre-archival size, informational only.
    pub original_length: u32,
    /// Exact number of content bytes that follow, a multiple of [`BLOCK_SIZE`].
    pub archived_length: u32,
    /// MD5 digest of the final on-flash content.
    pub content_hash: [u8; 16],
}

impl TargetHeader {
    /// Encoded size on the wire, excluding the boundary marker.
    pub const SIZE: usize = LABEL_LEN + 4 + 4 + 16;

    pub fn new(
        kind: TargetKind,
        original_length: u32,
        archived_length: u32,
        content_hash: [u8; 16],
    ) -> Self {
        let mut label = [0u8; LABEL_LEN];
        label[..kind.label().len()].copy_from_slice(kind.label().as_bytes());
        Self {
            label,
            original_length,
            archived_length,
            content_hash,
        }
    }

    /// Decode a header from the bytes following the boundary marker.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut label = [0u8; LABEL_LEN];
        label.copy_from_slice(&buf[..LABEL_LEN]);
        label[LABEL_LEN - 1] = 0;
        let original_length = u32::from_le_bytes(buf[LABEL_LEN..LABEL_LEN + 4].try_into().ok()?);
        let archived_length =
            u32::from_le_bytes(buf[LABEL_LEN + 4..LABEL_LEN + 8].try_into().ok()?);
        let mut content_hash = [0u8; 16];
        content_hash.copy_from_slice(&buf[LABEL_LEN + 8..Self::SIZE]);
        Some(Self {
            label,
            original_length,
            archived_length,
            content_hash,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..LABEL_LEN].copy_from_slice(&self.label);
        out[LABEL_LEN..LABEL_LEN + 4].copy_from_slice(&self.original_length.to_le_bytes());
        out[LABEL_LEN + 4..LABEL_LEN + 8].copy_from_slice(&self.archived_length.to_le_bytes());
        out[LABEL_LEN + 8..].copy_from_slice(&self.content_hash);
        out
    }

    /// Label up to the first NUL. Non-UTF-8 labels come back empty, which
    /// no resolver accepts anyway.
    pub fn label_str(&self) -> &str {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
        core::str::from_utf8(&self.label[..end]).unwrap_or("")
    }

    pub fn kind(&self) -> Option<TargetKind> {
        TargetKind::from_label(self.label_str())
    }
}

/// Assemble the leading block of an archive: the magic, zero-filled to a
/// full block.
pub fn magic_block() -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..ARCHIVE_MAGIC.len()].copy_from_slice(&ARCHIVE_MAGIC);
    block
}

/// Assemble a target header block: boundary marker, encoded header,
/// zero-filled to a full block.
pub fn header_block(header: &TargetHeader) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..BOUNDARY_MARKER.len()].copy_from_slice(&BOUNDARY_MARKER);
    block[BOUNDARY_MARKER.len()..BOUNDARY_MARKER.len() + TargetHeader::SIZE]
        .copy_from_slice(&header.encode());
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_exactly_one_prefix_of_a_block() {
        assert_eq!(ARCHIVE_MAGIC.len(), 32);
        assert_eq!(BOUNDARY_MARKER.len(), 16);
        assert!(TargetHeader::SIZE + BOUNDARY_MARKER.len() <= BLOCK_SIZE);
    }

    #[test]
    fn header_survives_encode_and_parse() {
        let header = TargetHeader::new(TargetKind::Filesystem, 1000, 4096, [0xAB; 16]);
        let parsed = TargetHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.label_str(), "spiffs");
        assert_eq!(parsed.kind(), Some(TargetKind::Filesystem));
    }

    #[test]
    fn label_is_forcibly_terminated() {
        let mut raw = [0u8; TargetHeader::SIZE];
        raw[..LABEL_LEN].copy_from_slice(&[b'x'; LABEL_LEN]);
        let header = TargetHeader::parse(&raw).unwrap();
        assert_eq!(header.label[LABEL_LEN - 1], 0);
        assert_eq!(header.label_str().len(), LABEL_LEN - 1);
    }

    #[test]
    fn unknown_labels_resolve_to_none() {
        assert_eq!(TargetKind::from_label("app"), Some(TargetKind::Code));
        assert_eq!(TargetKind::from_label("bootloader"), None);
        assert_eq!(TargetKind::from_label(""), None);
    }

    #[test]
    fn short_buffer_does_not_parse() {
        assert!(TargetHeader::parse(&[0u8; TargetHeader::SIZE - 1]).is_none());
    }
}
