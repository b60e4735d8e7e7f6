use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{config::VersionLayout, platform::PersistentBlock};

pub const DEFAULT_VERSION: &str = "1.0.0";

/// Dotted numeric firmware version, without a leading `v`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Normalizes a release tag such as `v2.3.0` into `2.3.0`.
    pub fn from_tag(tag: &str) -> Self {
        Self(tag.strip_prefix('v').unwrap_or(tag).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pulls a version out of an asset name like `NAT-A-fw-v2.4.1.bin`.
///
/// The marker is `-v`, or the first bare `v` when there is no `-v`. Digits and
/// dots after the marker are collected; leading noise is skipped and the first
/// other character after the run ends it. The dot in front of the file
/// extension is dropped. Returns an empty string when nothing is found.
pub fn extract_version_from_file_name(file_name: &str) -> String {
    let start = match file_name.find("-v") {
        Some(pos) => pos + 2,
        None => match file_name.find('v') {
            Some(pos) => pos + 1,
            None => return String::new(),
        },
    };

    let mut version = String::new();
    for ch in file_name[start..].chars() {
        if ch.is_ascii_digit() || ch == '.' {
            version.push(ch);
        } else if !version.is_empty() {
            break;
        }
    }

    version.trim_end_matches('.').to_string()
}

/// NUL-padded fixed-width encoding. Longer values are truncated.
pub fn encode_fixed(value: &str, width: usize) -> Vec<u8> {
    let mut out = vec![0_u8; width];
    let bytes = value.as_bytes();
    let len = bytes.len().min(width);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Inverse of [`encode_fixed`]. Erased flash (`0xFF`) counts as padding too.
pub fn decode_fixed(raw: &[u8]) -> Option<String> {
    let end = raw
        .iter()
        .position(|byte| *byte == 0x00 || *byte == 0xFF)
        .unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end]).ok()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

pub struct VersionStore<B> {
    block: B,
    layout: VersionLayout,
    default_version: Version,
}

impl<B: PersistentBlock> VersionStore<B> {
    pub fn new(block: B, layout: VersionLayout, default_version: Version) -> Self {
        let layout = if layout.is_valid() {
            layout
        } else {
            warn!("invalid version layout {layout:?}; using default");
            VersionLayout::default()
        };

        Self {
            block,
            layout,
            default_version,
        }
    }

    pub fn read(&mut self) -> Version {
        let mut raw = vec![0_u8; self.layout.width];
        if let Err(err) = self.block.read(self.layout.offset, &mut raw) {
            warn!("failed to read stored firmware version: {err}");
            return self.default_version.clone();
        }

        decode_fixed(&raw)
            .map(Version)
            .unwrap_or_else(|| self.default_version.clone())
    }

    pub fn write(&mut self, version: &Version) {
        if version.as_str().len() > self.layout.width {
            warn!(
                "version `{version}` exceeds {} bytes and will be truncated",
                self.layout.width
            );
        }

        let raw = encode_fixed(version.as_str(), self.layout.width);
        let result = self
            .block
            .write(self.layout.offset, &raw)
            .and_then(|()| self.block.commit());
        if let Err(err) = result {
            warn!("failed to persist firmware version `{version}`: {err}");
        }
    }

    pub fn block(&self) -> &B {
        &self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBlock;
    use pretty_assertions::assert_eq;

    fn store() -> VersionStore<MemoryBlock> {
        VersionStore::new(
            MemoryBlock::new(64),
            VersionLayout::default(),
            Version::new(DEFAULT_VERSION),
        )
    }

    #[test]
    fn never_written_store_reads_default() {
        assert_eq!(store().read(), Version::new("1.0.0"));
    }

    #[test]
    fn erased_flash_reads_default() {
        let mut store = VersionStore::new(
            MemoryBlock::filled(64, 0xFF),
            VersionLayout::default(),
            Version::new(DEFAULT_VERSION),
        );
        assert_eq!(store.read(), Version::new("1.0.0"));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut store = store();
        for value in ["1.0.10", "2.4.1", "0", "12345678901234567890", "1.2.3-rc.1"] {
            store.write(&Version::new(value));
            assert_eq!(store.read().as_str(), value);
        }
    }

    #[test]
    fn shorter_write_clears_previous_tail() {
        let mut store = store();
        store.write(&Version::new("10.20.30"));
        store.write(&Version::new("1.0"));

        assert_eq!(store.read().as_str(), "1.0");
        assert_eq!(&store.block().bytes()[3..20], &[0_u8; 17]);
    }

    #[test]
    fn overlong_value_is_truncated_to_width() {
        let mut store = store();
        store.write(&Version::new("1.2.3.4.5.6.7.8.9.10.11"));
        assert_eq!(store.read().as_str(), "1.2.3.4.5.6.7.8.9.10");
    }

    #[test]
    fn write_commits_immediately() {
        let mut store = store();
        store.write(&Version::new("2.0.0"));
        assert_eq!(store.block().commits(), 1);
    }

    #[test]
    fn failing_storage_reads_default() {
        let mut block = MemoryBlock::new(64);
        block.fail_reads();
        let mut store =
            VersionStore::new(block, VersionLayout::default(), Version::new(DEFAULT_VERSION));
        assert_eq!(store.read().as_str(), "1.0.0");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_fixed(&[0xC3, 0x28, 0x00]), None);
        assert_eq!(decode_fixed(b"   \0\0"), None);
        assert_eq!(decode_fixed(b" 1.0.1 \0"), Some("1.0.1".to_string()));
    }

    #[test]
    fn tag_prefix_is_stripped_once() {
        assert_eq!(Version::from_tag("v2.3.0").as_str(), "2.3.0");
        assert_eq!(Version::from_tag("2.3.0").as_str(), "2.3.0");
        assert_eq!(Version::from_tag("vv1").as_str(), "v1");
    }

    #[test]
    fn extracts_version_from_asset_name() {
        assert_eq!(extract_version_from_file_name("NAT-A-fw-v2.4.1.bin"), "2.4.1");
        assert_eq!(extract_version_from_file_name("NAT-A-fw_v3.0.bin"), "3.0");
        assert_eq!(extract_version_from_file_name("NAT-A-fw-vX1.2.bin"), "1.2");
    }

    #[test]
    fn asset_name_without_marker_has_no_version() {
        assert_eq!(extract_version_from_file_name("NAT-A-fw-2.4.1.bin"), "");
        assert_eq!(extract_version_from_file_name("NAT-A-fw-v.bin"), "");
    }

    #[test]
    fn invalid_layout_falls_back_to_default() {
        let layout = VersionLayout {
            block_size: 16,
            offset: 8,
            width: 20,
        };
        let mut store =
            VersionStore::new(MemoryBlock::new(64), layout, Version::new(DEFAULT_VERSION));

        store.write(&Version::new("2.4.1"));

        assert_eq!(&store.block().bytes()[..5], b"2.4.1");
        assert_eq!(store.read().as_str(), "2.4.1");
    }
}
