//! ISO-9660 image writer
//!
//! Writes a single-directory, level-1 style image:
//!
//! ```text
//! sector  0-15   system area (zero)
//! sector  16     primary volume descriptor
//! sector  17     volume descriptor set terminator
//! sector  18     type-L path table
//! sector  19     type-M path table
//! sector  20..   root directory
//! then           file extents, in identifier order
//! ```

use crate::domain::ports::{ImageFile, IsoImageWriter};
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Logical sector and block size
pub const SECTOR_SIZE: usize = 2048;

const SYSTEM_AREA_SECTORS: usize = 16;
const PVD_SECTOR: usize = 16;
const TERMINATOR_SECTOR: usize = 17;
const L_PATH_TABLE_SECTOR: usize = 18;
const M_PATH_TABLE_SECTOR: usize = 19;
const ROOT_DIR_SECTOR: usize = 20;

const MAX_LABEL_LEN: usize = 32;
const MAX_IDENTIFIER_LEN: usize = 30;
const PATH_TABLE_SIZE: u32 = 10;
const DIR_FLAG: u8 = 0x02;

// =============================================================================
// Encoding Helpers
// =============================================================================

fn both_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn both_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn padded(buf: &mut [u8], offset: usize, len: usize, text: &str) {
    let field = &mut buf[offset..offset + len];
    field.fill(b' ');
    let bytes = text.as_bytes();
    let n = bytes.len().min(len);
    field[..n].copy_from_slice(&bytes[..n]);
}

/// 17-byte volume descriptor timestamp, GMT
fn dec_datetime(at: &DateTime<Utc>) -> [u8; 17] {
    let mut out = [0u8; 17];
    let text = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}00",
        at.year(),
        at.month(),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    );
    out[..16].copy_from_slice(&text.as_bytes()[..16]);
    out
}

/// 7-byte directory record timestamp, GMT
fn dir_datetime(at: &DateTime<Utc>) -> [u8; 7] {
    [
        (at.year() - 1900).clamp(0, 255) as u8,
        at.month() as u8,
        at.day() as u8,
        at.hour() as u8,
        at.minute() as u8,
        at.second() as u8,
        0,
    ]
}

fn sectors_for(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::IsoImage(format!("{} too large: {}", what, value)))
}

// =============================================================================
// Directory Records
// =============================================================================

struct DirRecord {
    identifier: Vec<u8>,
    extent: u32,
    size: u32,
    flags: u8,
}

impl DirRecord {
    fn len(&self) -> usize {
        let base = 33 + self.identifier.len();
        base + base % 2
    }

    fn encode(&self, recorded: &[u8; 7]) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        buf[0] = self.len() as u8;
        both_u32(&mut buf, 2, self.extent);
        both_u32(&mut buf, 10, self.size);
        buf[18..25].copy_from_slice(recorded);
        buf[25] = self.flags;
        both_u16(&mut buf, 28, 1);
        buf[32] = self.identifier.len() as u8;
        buf[33..33 + self.identifier.len()].copy_from_slice(&self.identifier);
        buf
    }
}

/// File identifier: upper-cased name with version suffix
pub fn file_identifier(name: &str) -> String {
    format!("{};1", name.to_uppercase())
}

// =============================================================================
// Writer
// =============================================================================

/// In-memory ISO-9660 writer
#[derive(Debug, Clone, Default)]
pub struct IsoWriter {
    /// Fixed recording time; the current time when unset
    recorded_at: Option<DateTime<Utc>>,
}

impl IsoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed recording time, for reproducible images
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    fn validate(volume_label: &str, files: &[ImageFile]) -> Result<()> {
        if volume_label.is_empty() || volume_label.len() > MAX_LABEL_LEN {
            return Err(Error::IsoImage(format!(
                "volume label \"{}\" must be 1 to {} characters",
                volume_label, MAX_LABEL_LEN
            )));
        }
        for (i, file) in files.iter().enumerate() {
            if file.name.is_empty() || file.name.len() > MAX_IDENTIFIER_LEN || !file.name.is_ascii() {
                return Err(Error::IsoImage(format!("invalid file name \"{}\"", file.name)));
            }
            if files[..i]
                .iter()
                .any(|f| f.name.eq_ignore_ascii_case(&file.name))
            {
                return Err(Error::IsoImage(format!("duplicate file name \"{}\"", file.name)));
            }
        }
        Ok(())
    }

    fn build(&self, volume_label: &str, files: &[ImageFile]) -> Result<Vec<u8>> {
        Self::validate(volume_label, files)?;
        let now = self.recorded_at.unwrap_or_else(Utc::now);
        let recorded = dir_datetime(&now);

        let mut entries: Vec<(String, &ImageFile)> =
            files.iter().map(|f| (file_identifier(&f.name), f)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        // Root directory sectors; records never straddle a sector boundary
        let mut record_lens = vec![34usize, 34];
        record_lens.extend(entries.iter().map(|(id, _)| {
            let base = 33 + id.len();
            base + base % 2
        }));
        let mut root_sectors = 1;
        let mut used = 0;
        for len in &record_lens {
            if used + len > SECTOR_SIZE {
                root_sectors += 1;
                used = 0;
            }
            used += len;
        }
        let root_size = to_u32(root_sectors * SECTOR_SIZE, "root directory")?;
        let root_extent = ROOT_DIR_SECTOR as u32;

        let mut next = ROOT_DIR_SECTOR + root_sectors;
        let mut records = vec![
            DirRecord {
                identifier: vec![0],
                extent: root_extent,
                size: root_size,
                flags: DIR_FLAG,
            },
            DirRecord {
                identifier: vec![1],
                extent: root_extent,
                size: root_size,
                flags: DIR_FLAG,
            },
        ];
        for (id, file) in &entries {
            records.push(DirRecord {
                identifier: id.as_bytes().to_vec(),
                extent: to_u32(next, "image")?,
                size: to_u32(file.data.len(), "file")?,
                flags: 0,
            });
            next += sectors_for(file.data.len());
        }
        let total_sectors = next;

        let mut image = vec![0u8; total_sectors * SECTOR_SIZE];

        // Primary volume descriptor
        {
            let pvd = &mut image[PVD_SECTOR * SECTOR_SIZE..(PVD_SECTOR + 1) * SECTOR_SIZE];
            pvd[0] = 1;
            pvd[1..6].copy_from_slice(b"CD001");
            pvd[6] = 1;
            padded(pvd, 8, 32, "");
            padded(pvd, 40, 32, volume_label);
            both_u32(pvd, 80, to_u32(total_sectors, "image")?);
            both_u16(pvd, 120, 1);
            both_u16(pvd, 124, 1);
            both_u16(pvd, 128, SECTOR_SIZE as u16);
            both_u32(pvd, 132, PATH_TABLE_SIZE);
            pvd[140..144].copy_from_slice(&(L_PATH_TABLE_SECTOR as u32).to_le_bytes());
            pvd[148..152].copy_from_slice(&(M_PATH_TABLE_SECTOR as u32).to_be_bytes());
            let root = records[0].encode(&recorded);
            pvd[156..156 + root.len()].copy_from_slice(&root);
            padded(pvd, 190, 128, "");
            padded(pvd, 318, 128, "");
            padded(pvd, 446, 128, "");
            padded(pvd, 574, 128, env!("CARGO_PKG_NAME"));
            padded(pvd, 702, 37, "");
            padded(pvd, 739, 37, "");
            padded(pvd, 776, 37, "");
            let stamp = dec_datetime(&now);
            pvd[813..830].copy_from_slice(&stamp);
            pvd[830..847].copy_from_slice(&stamp);
            pvd[847..863].fill(b'0');
            pvd[864..880].fill(b'0');
            pvd[881] = 1;
        }

        // Volume descriptor set terminator
        {
            let term = &mut image[TERMINATOR_SECTOR * SECTOR_SIZE..];
            term[0] = 255;
            term[1..6].copy_from_slice(b"CD001");
            term[6] = 1;
        }

        // Path tables, root entry only
        for (sector, big_endian) in [(L_PATH_TABLE_SECTOR, false), (M_PATH_TABLE_SECTOR, true)] {
            let table = &mut image[sector * SECTOR_SIZE..];
            table[0] = 1;
            let (extent, parent) = if big_endian {
                (root_extent.to_be_bytes(), 1u16.to_be_bytes())
            } else {
                (root_extent.to_le_bytes(), 1u16.to_le_bytes())
            };
            table[2..6].copy_from_slice(&extent);
            table[6..8].copy_from_slice(&parent);
        }

        // Root directory
        let mut offset = ROOT_DIR_SECTOR * SECTOR_SIZE;
        for record in &records {
            let encoded = record.encode(&recorded);
            let in_sector = offset % SECTOR_SIZE;
            if in_sector + encoded.len() > SECTOR_SIZE {
                offset += SECTOR_SIZE - in_sector;
            }
            image[offset..offset + encoded.len()].copy_from_slice(&encoded);
            offset += encoded.len();
        }

        // File extents
        for (record, (_, file)) in records[2..].iter().zip(&entries) {
            let start = record.extent as usize * SECTOR_SIZE;
            image[start..start + file.data.len()].copy_from_slice(&file.data);
        }

        debug_assert!(image[..SYSTEM_AREA_SECTORS * SECTOR_SIZE].iter().all(|b| *b == 0));
        Ok(image)
    }
}

impl IsoImageWriter for IsoWriter {
    fn write_iso(&self, volume_label: &str, files: &[ImageFile]) -> Result<Vec<u8>> {
        self.build(volume_label, files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn files() -> Vec<ImageFile> {
        vec![
            ImageFile::new("user-data", b"#cloud-config\nhostname: node-1\n".to_vec()),
            ImageFile::new("meta-data", b"instance-id: node-1\n".to_vec()),
            ImageFile::new("network-config", vec![b'x'; 3000]),
        ]
    }

    fn writer() -> IsoWriter {
        IsoWriter::new().with_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn u32_le(buf: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    /// Walk the root directory and return (identifier, extent, size)
    fn root_entries(image: &[u8]) -> Vec<(String, u32, u32)> {
        let pvd = &image[PVD_SECTOR * SECTOR_SIZE..];
        let root_extent = u32_le(pvd, 156 + 2) as usize;
        let root_size = u32_le(pvd, 156 + 10) as usize;
        let dir = &image[root_extent * SECTOR_SIZE..root_extent * SECTOR_SIZE + root_size];

        let mut out = Vec::new();
        let mut offset = 0;
        while offset < dir.len() {
            let len = dir[offset] as usize;
            if len == 0 {
                offset = (offset / SECTOR_SIZE + 1) * SECTOR_SIZE;
                continue;
            }
            let rec = &dir[offset..offset + len];
            let id_len = rec[32] as usize;
            let id = String::from_utf8_lossy(&rec[33..33 + id_len]).to_string();
            out.push((id, u32_le(rec, 2), u32_le(rec, 10)));
            offset += len;
        }
        out
    }

    #[test]
    fn test_descriptors() {
        let image = writer().write_iso("cidata", &files()).unwrap();
        assert_eq!(image.len() % SECTOR_SIZE, 0);

        let pvd = &image[PVD_SECTOR * SECTOR_SIZE..];
        assert_eq!(pvd[0], 1);
        assert_eq!(&pvd[1..6], b"CD001");
        assert_eq!(&pvd[40..46], b"cidata");
        assert_eq!(pvd[46], b' ');
        assert_eq!(u32_le(pvd, 80) as usize * SECTOR_SIZE, image.len());
        assert_eq!(&pvd[813..817], b"2024");

        let term = &image[TERMINATOR_SECTOR * SECTOR_SIZE..];
        assert_eq!(term[0], 255);
        assert_eq!(&term[1..6], b"CD001");
    }

    #[test]
    fn test_files_are_sorted_and_readable() {
        let image = writer().write_iso("cidata", &files()).unwrap();
        let entries = root_entries(&image);

        let names: Vec<&str> = entries[2..].iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["META-DATA;1", "NETWORK-CONFIG;1", "USER-DATA;1"]);

        for (name, extent, size) in &entries[2..] {
            let start = *extent as usize * SECTOR_SIZE;
            let data = &image[start..start + *size as usize];
            let source = files()
                .into_iter()
                .find(|f| file_identifier(&f.name) == *name)
                .unwrap();
            assert_eq!(data, source.data.as_slice());
        }

        // network-config spans two sectors, so user-data starts two later
        assert_eq!(entries[4].1, entries[3].1 + 2);
    }

    #[test]
    fn test_fixed_timestamp_is_reproducible() {
        let a = writer().write_iso("cidata", &files()).unwrap();
        let b = writer().write_iso("cidata", &files()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dup = vec![ImageFile::new("a", vec![]), ImageFile::new("A", vec![])];
        assert_matches!(writer().write_iso("cidata", &dup), Err(Error::IsoImage(_)));
        assert_matches!(writer().write_iso("", &files()), Err(Error::IsoImage(_)));
        assert_matches!(
            writer().write_iso(&"x".repeat(33), &files()),
            Err(Error::IsoImage(_))
        );
    }

    #[test]
    fn test_empty_file() {
        let image = writer()
            .write_iso("cidata", &[ImageFile::new("empty", vec![])])
            .unwrap();
        let entries = root_entries(&image);
        assert_eq!(entries[2].0, "EMPTY;1");
        assert_eq!(entries[2].2, 0);
    }
}
