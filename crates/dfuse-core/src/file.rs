//! The DfuSe `.dfu` container format.
//!
//! Layered little-endian layout (UM0391):
//!
//! - file prefix, 11 bytes: `"DfuSe"`, version, total size (file minus
//!   suffix), image count
//! - per image: 274-byte prefix (`"Target"`, alt setting, named flag,
//!   255-byte name, image size, element count), then per element an
//!   8-byte address/size header followed by the payload
//! - 16-byte suffix: device/product/vendor BCD versions, format tag
//!   `0x011A`, `"UFD"`, suffix length, CRC-32
//!
//! The suffix CRC is the bitwise complement of the IEEE CRC-32 of every
//! byte that precedes the stored value.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc_any::CRCu32;
use thiserror::Error;
use tracing::warn;

/// File prefix signature.
pub const FILE_SIGNATURE: &[u8; 5] = b"DfuSe";
/// Image prefix signature.
pub const IMAGE_SIGNATURE: &[u8; 6] = b"Target";
/// Suffix tag, stored reversed on the wire per the DFU 1.1 suffix.
pub const SUFFIX_TAG: &[u8; 3] = b"UFD";
/// DfuSe container version carried in the file prefix.
pub const FORMAT_VERSION: u8 = 1;
/// `bcdDFU` value carried in the suffix.
pub const DFU_FORMAT: u16 = 0x011A;
/// Fixed suffix length.
pub const SUFFIX_LENGTH: u8 = 16;

const FILE_PREFIX_LEN: usize = 11;
const IMAGE_PREFIX_LEN: usize = 274;
const ELEMENT_HEADER_LEN: usize = 8;
const NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    BadSignature,
    BadVersion,
    BadSuffixTag,
    BadSuffixLength,
    BadFormat,
    CrcMismatch,
    Truncated,
    SizeInconsistency,
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::BadSignature => write!(f, "bad signature"),
            DecodeErrorKind::BadVersion => write!(f, "unsupported container version"),
            DecodeErrorKind::BadSuffixTag => write!(f, "bad suffix tag"),
            DecodeErrorKind::BadSuffixLength => write!(f, "bad suffix length"),
            DecodeErrorKind::BadFormat => write!(f, "unexpected DFU format value"),
            DecodeErrorKind::CrcMismatch => write!(f, "CRC mismatch"),
            DecodeErrorKind::Truncated => write!(f, "truncated input"),
            DecodeErrorKind::SizeInconsistency => write!(f, "declared size inconsistency"),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} at offset {offset}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: usize,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

/// One firmware element: a payload destined for `address`.
///
/// `size` is the length declared in the element header; it must equal
/// `data.len()`, and the decoder only produces elements where it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuElement {
    pub address: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

/// One image: the elements for a single alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuImage {
    pub alt_setting: u8,
    /// Present when the named flag in the image prefix is nonzero.
    pub name: Option<String>,
    pub elements: Vec<DfuElement>,
}

impl DfuImage {
    /// On-wire size of the element area (headers plus payloads).
    pub fn elements_size(&self) -> u32 {
        self.elements
            .iter()
            .map(|e| ELEMENT_HEADER_LEN as u32 + e.data.len() as u32)
            .sum()
    }
}

/// Values carried in the 16-byte file suffix (besides the CRC, which is
/// recomputed on encode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DfuSuffix {
    pub device_version: u16,
    pub product_id: u16,
    pub vendor_id: u16,
    pub dfu_format: u16,
}

/// A decoded DfuSe container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuFile {
    pub version: u8,
    pub images: Vec<DfuImage>,
    pub suffix: DfuSuffix,
}

impl DfuFile {
    /// Decode and fully validate a DfuSe container.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(bytes, false)
    }

    /// Like [`DfuFile::from_bytes`], but a `bcdDFU` mismatch in the
    /// suffix only logs a warning. Some vendor tools emit stale values
    /// there.
    pub fn from_bytes_lenient(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(bytes, true)
    }

    fn decode(bytes: &[u8], lenient: bool) -> Result<Self, DecodeError> {
        let mut cur = Cursor::new(bytes);

        let mut signature = [0u8; 5];
        read_exact(&mut cur, &mut signature)?;
        if &signature != FILE_SIGNATURE {
            return Err(DecodeError::new(DecodeErrorKind::BadSignature, 0));
        }

        let version = read_u8(&mut cur)?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::new(DecodeErrorKind::BadVersion, 5));
        }

        let declared_size = read_u32(&mut cur)?;
        let image_count = read_u8(&mut cur)?;

        // The prefix size field covers everything but the suffix.
        let expected = bytes.len().wrapping_sub(SUFFIX_LENGTH as usize);
        if declared_size as usize != expected {
            return Err(DecodeError::new(DecodeErrorKind::SizeInconsistency, 6));
        }

        let mut images = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            images.push(Self::decode_image(&mut cur)?);
        }

        // 16-byte suffix.
        let suffix_offset = cur.position() as usize;
        let device_version = read_u16(&mut cur)?;
        let product_id = read_u16(&mut cur)?;
        let vendor_id = read_u16(&mut cur)?;
        let dfu_format = read_u16(&mut cur)?;

        let mut tag = [0u8; 3];
        read_exact(&mut cur, &mut tag)?;
        if &tag != SUFFIX_TAG {
            return Err(DecodeError::new(
                DecodeErrorKind::BadSuffixTag,
                suffix_offset + 8,
            ));
        }

        let suffix_len = read_u8(&mut cur)?;
        if suffix_len != SUFFIX_LENGTH {
            return Err(DecodeError::new(
                DecodeErrorKind::BadSuffixLength,
                suffix_offset + 11,
            ));
        }

        if dfu_format != DFU_FORMAT {
            if lenient {
                warn!(
                    dfu_format = format!("0x{dfu_format:04X}"),
                    "Unexpected DFU format value in suffix"
                );
            } else {
                return Err(DecodeError::new(
                    DecodeErrorKind::BadFormat,
                    suffix_offset + 6,
                ));
            }
        }

        let crc_offset = cur.position() as usize;
        let stored_crc = read_u32(&mut cur)?;
        let computed = dfuse_crc(&bytes[..crc_offset]);
        if stored_crc != computed {
            return Err(DecodeError::new(DecodeErrorKind::CrcMismatch, crc_offset));
        }

        Ok(DfuFile {
            version,
            images,
            suffix: DfuSuffix {
                device_version,
                product_id,
                vendor_id,
                dfu_format,
            },
        })
    }

    fn decode_image(cur: &mut Cursor<&[u8]>) -> Result<DfuImage, DecodeError> {
        let prefix_offset = cur.position() as usize;

        let mut signature = [0u8; 6];
        read_exact(cur, &mut signature)?;
        if &signature != IMAGE_SIGNATURE {
            return Err(DecodeError::new(DecodeErrorKind::BadSignature, prefix_offset));
        }

        let alt_setting = read_u8(cur)?;
        let is_named = read_u32(cur)?;
        let mut name_bytes = [0u8; NAME_LEN];
        read_exact(cur, &mut name_bytes)?;
        let declared_size = read_u32(cur)?;
        let element_count = read_u32(cur)?;

        let name = if is_named != 0 {
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
            Some(String::from_utf8_lossy(&name_bytes[..end]).into_owned())
        } else {
            None
        };

        let mut elements = Vec::with_capacity(element_count as usize);
        for _ in 0..element_count {
            let address = read_u32(cur)?;
            let size = read_u32(cur)?;
            let data_offset = cur.position() as usize;
            let mut data = vec![0u8; size as usize];
            read_exact(cur, &mut data).map_err(|mut e| {
                e.offset = data_offset;
                e
            })?;
            elements.push(DfuElement {
                address,
                size,
                data,
            });
        }

        let image = DfuImage {
            alt_setting,
            name,
            elements,
        };
        if image.elements_size() != declared_size {
            return Err(DecodeError::new(
                DecodeErrorKind::SizeInconsistency,
                prefix_offset + 266,
            ));
        }
        Ok(image)
    }

    /// Encode back to the on-wire container, computing the suffix CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let images_size: usize = self
            .images
            .iter()
            .map(|i| IMAGE_PREFIX_LEN + i.elements_size() as usize)
            .sum();
        let total = FILE_PREFIX_LEN + images_size;

        let mut out = Vec::with_capacity(total + SUFFIX_LENGTH as usize);
        out.extend_from_slice(FILE_SIGNATURE);
        out.push(self.version);
        out.write_u32::<LittleEndian>(total as u32).unwrap();
        out.push(self.images.len() as u8);

        for image in &self.images {
            out.extend_from_slice(IMAGE_SIGNATURE);
            out.push(image.alt_setting);
            out.write_u32::<LittleEndian>(image.name.is_some() as u32)
                .unwrap();
            let mut name_bytes = [0u8; NAME_LEN];
            if let Some(name) = &image.name {
                let len = name.len().min(NAME_LEN);
                name_bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
            }
            out.extend_from_slice(&name_bytes);
            out.write_u32::<LittleEndian>(image.elements_size()).unwrap();
            out.write_u32::<LittleEndian>(image.elements.len() as u32)
                .unwrap();
            for element in &image.elements {
                out.write_u32::<LittleEndian>(element.address).unwrap();
                out.write_u32::<LittleEndian>(element.size).unwrap();
                out.extend_from_slice(&element.data);
            }
        }

        out.write_u16::<LittleEndian>(self.suffix.device_version)
            .unwrap();
        out.write_u16::<LittleEndian>(self.suffix.product_id).unwrap();
        out.write_u16::<LittleEndian>(self.suffix.vendor_id).unwrap();
        out.write_u16::<LittleEndian>(self.suffix.dfu_format).unwrap();
        out.extend_from_slice(SUFFIX_TAG);
        out.push(SUFFIX_LENGTH);
        let crc = dfuse_crc(&out);
        out.write_u32::<LittleEndian>(crc).unwrap();
        out
    }

    /// Total payload bytes across all images.
    pub fn payload_size(&self) -> usize {
        self.images
            .iter()
            .flat_map(|i| &i.elements)
            .map(|e| e.data.len())
            .sum()
    }
}

/// The DfuSe suffix checksum: complement of the IEEE CRC-32 over the
/// byte stream.
pub fn dfuse_crc(bytes: &[u8]) -> u32 {
    let mut crc = CRCu32::crc32();
    crc.digest(bytes);
    !crc.get_crc()
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
    let offset = cur.position() as usize;
    cur.read_u8()
        .map_err(|_| DecodeError::new(DecodeErrorKind::Truncated, offset))
}

fn read_u16(cur: &mut Cursor<&[u8]>) -> Result<u16, DecodeError> {
    let offset = cur.position() as usize;
    cur.read_u16::<LittleEndian>()
        .map_err(|_| DecodeError::new(DecodeErrorKind::Truncated, offset))
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32, DecodeError> {
    let offset = cur.position() as usize;
    cur.read_u32::<LittleEndian>()
        .map_err(|_| DecodeError::new(DecodeErrorKind::Truncated, offset))
}

fn read_exact(cur: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), DecodeError> {
    let offset = cur.position() as usize;
    cur.read_exact(buf)
        .map_err(|_| DecodeError::new(DecodeErrorKind::Truncated, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_byte_file() -> DfuFile {
        DfuFile {
            version: FORMAT_VERSION,
            images: vec![DfuImage {
                alt_setting: 0,
                name: Some("Internal Flash".to_string()),
                elements: vec![DfuElement {
                    address: 0x0800_0000,
                    size: 1,
                    data: vec![0xAA],
                }],
            }],
            suffix: DfuSuffix {
                device_version: 0xFFFF,
                product_id: 0xDF11,
                vendor_id: 0x0483,
                dfu_format: DFU_FORMAT,
            },
        }
    }

    #[test]
    fn test_crc_reference_vector() {
        // IEEE CRC-32 of "123456789" is 0xCBF43926; DfuSe stores the
        // complement.
        assert_eq!(dfuse_crc(b"123456789"), !0xCBF4_3926);
    }

    #[test]
    fn test_roundtrip_one_byte_payload() {
        let file = one_byte_file();
        let bytes = file.to_bytes();

        // prefix + image prefix + element header + 1 byte + suffix
        assert_eq!(bytes.len(), 11 + 274 + 8 + 1 + 16);
        assert_eq!(&bytes[..5], b"DfuSe");

        let decoded = DfuFile::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.images[0].elements[0].data, vec![0xAA]);
        assert_eq!(decoded.images[0].elements[0].address, 0x0800_0000);
        assert_eq!(decoded, file);
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn test_bad_file_signature() {
        let mut bytes = one_byte_file().to_bytes();
        bytes[4] = b'x'; // "DfuSx"
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadSignature);
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn test_bad_image_signature() {
        let mut bytes = one_byte_file().to_bytes();
        bytes[11] = b't'; // first image prefix starts right after the file prefix
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadSignature);
        assert_eq!(err.offset, 11);
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = one_byte_file().to_bytes();
        bytes[5] = 2;
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadVersion);
    }

    #[test]
    fn test_bad_suffix_tag() {
        let mut bytes = one_byte_file().to_bytes();
        let len = bytes.len();
        bytes[len - 8] = b'X'; // 'U' of "UFD"
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadSuffixTag);
    }

    #[test]
    fn test_crc_mismatch() {
        let mut bytes = one_byte_file().to_bytes();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::CrcMismatch);
        assert_eq!(err.offset, len - 4);
    }

    #[test]
    fn test_payload_corruption_caught_by_crc() {
        let mut bytes = one_byte_file().to_bytes();
        bytes[11 + 274 + 8] = 0xAB; // the payload byte
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::CrcMismatch);
    }

    #[test]
    fn test_format_mismatch_strict_and_lenient() {
        let mut file = one_byte_file();
        file.suffix.dfu_format = 0x0100;
        let bytes = file.to_bytes();

        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::BadFormat);

        let decoded = DfuFile::from_bytes_lenient(&bytes).unwrap();
        assert_eq!(decoded.suffix.dfu_format, 0x0100);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = one_byte_file().to_bytes();
        let err = DfuFile::from_bytes(&bytes[..8]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Truncated);
    }

    #[test]
    fn test_declared_size_mismatch() {
        let mut bytes = one_byte_file().to_bytes();
        bytes[6] ^= 0x01; // prefix size field
        let err = DfuFile::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::SizeInconsistency);
        assert_eq!(err.offset, 6);
    }

    #[test]
    fn test_multi_element_image_sizes() {
        let file = DfuFile {
            version: FORMAT_VERSION,
            images: vec![DfuImage {
                alt_setting: 0,
                name: None,
                elements: vec![
                    DfuElement {
                        address: 0x0800_0000,
                        size: 100,
                        data: vec![0x11; 100],
                    },
                    DfuElement {
                        address: 0x0800_1000,
                        size: 50,
                        data: vec![0x22; 50],
                    },
                ],
            }],
            suffix: DfuSuffix {
                dfu_format: DFU_FORMAT,
                ..Default::default()
            },
        };
        assert_eq!(file.images[0].elements_size(), 8 + 100 + 8 + 50);
        assert_eq!(file.payload_size(), 150);

        let decoded = DfuFile::from_bytes(&file.to_bytes()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn test_unnamed_image_roundtrip() {
        let mut file = one_byte_file();
        file.images[0].name = None;
        let decoded = DfuFile::from_bytes(&file.to_bytes()).unwrap();
        assert_eq!(decoded.images[0].name, None);
    }
}
