//! Restores capture metadata on freshly mirrored files.
//!
//! The NAS keeps the original modification time, which is usually the moment
//! the photo or clip was taken. After a download the local copy gets that
//! time back, JPEGs get an EXIF capture date when they have none, and MP4
//! family containers get `mvhd.creation_time` when it is still zero. Existing
//! values are never overwritten.

use chrono::{Local, TimeZone};
use exif::{experimental::Writer, Field, In, Tag, Value};
use filetime::FileTime;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{atomic, Result};

/// Seconds between 1904-01-01 (QuickTime epoch) and 1970-01-01.
pub const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

const MP4_FAMILY: &[&str] = &["mp4", "m4v", "mov", "3gp"];
const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// What the repair pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairOutcome {
    pub capture_tag_written: bool,
    pub creation_time_written: bool,
    pub mtime_set: bool,
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Runs every applicable repair for `path` using the remote modification time.
///
/// Tag injection happens first because it rewrites the file; the mtime is set
/// last so it survives.
pub async fn repair(path: &Path, modified_at_epoch_seconds: Option<i64>) -> Result<RepairOutcome> {
    let mut outcome = RepairOutcome::default();
    let Some(epoch) = modified_at_epoch_seconds.filter(|t| *t > 0) else {
        return Ok(outcome);
    };

    let ext = extension(path);
    if ext == "jpg" || ext == "jpeg" {
        match inject_capture_time(path, epoch).await {
            Ok(written) => outcome.capture_tag_written = written,
            Err(e) => tracing::warn!("Could not add capture time to {}: {e}", path.display()),
        }
    } else if MP4_FAMILY.contains(&ext.as_str()) {
        let owned: PathBuf = path.to_path_buf();
        match tokio::task::spawn_blocking(move || patch_mvhd_creation_time(&owned, epoch as u64)).await {
            Ok(Ok(written)) => outcome.creation_time_written = written,
            Ok(Err(e)) => tracing::warn!("Could not set creation time on {}: {e}", path.display()),
            Err(e) => tracing::warn!("Creation time task failed for {}: {e}", path.display()),
        }
    }

    set_mtime(path, epoch)?;
    outcome.mtime_set = true;
    Ok(outcome)
}

pub fn set_mtime(path: &Path, epoch_seconds: i64) -> Result<()> {
    filetime::set_file_mtime(path, FileTime::from_unix_time(epoch_seconds, 0))?;
    Ok(())
}

/// EXIF date format, in local time like camera clocks.
fn exif_datetime(epoch_seconds: i64) -> Option<String> {
    Local
        .timestamp_opt(epoch_seconds, 0)
        .single()
        .map(|t| t.format("%Y:%m:%d %H:%M:%S").to_string())
}

// --- JPEG / EXIF ---

/// Adds `DateTimeOriginal` (and `DateTime` when absent) unless the image
/// already carries a capture time. Returns whether the file was rewritten.
pub async fn inject_capture_time(path: &Path, epoch_seconds: i64) -> Result<bool> {
    let Some(stamp) = exif_datetime(epoch_seconds) else {
        return Ok(false);
    };
    let data = tokio::fs::read(path).await?;
    let Some(rewritten) = with_capture_time(&data, &stamp)? else {
        return Ok(false);
    };
    atomic::commit_bytes(path, rewritten).await?;
    tracing::debug!("Added capture time {stamp} to {}", path.display());
    Ok(true)
}

fn has_capture_time(exif: &exif::Exif) -> bool {
    exif.get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .is_some_and(|f| !matches!(&f.value, Value::Ascii(v) if v.iter().all(|s| s.is_empty())))
}

/// Whether a local JPEG of a different size than the remote one is the
/// remote file after [`repair`] added a capture time.
///
/// The copy must be larger by at most one APP1 segment, carry the remote
/// mtime, and hold a `DateTimeOriginal`.
pub async fn is_repaired_copy(
    path: &Path,
    local: &std::fs::Metadata,
    remote_size: u64,
    remote_mtime: Option<i64>,
) -> bool {
    let ext = extension(path);
    if ext != "jpg" && ext != "jpeg" {
        return false;
    }
    let Some(mtime) = remote_mtime.filter(|t| *t > 0) else {
        return false;
    };
    let grown = local.len().saturating_sub(remote_size);
    if grown == 0 || grown > u16::MAX as u64 + 2 {
        return false;
    }
    if FileTime::from_last_modification_time(local).unix_seconds() != mtime {
        return false;
    }
    let Ok(data) = tokio::fs::read(path).await else {
        return false;
    };
    exif::Reader::new()
        .read_from_container(&mut BufReader::new(Cursor::new(data)))
        .is_ok_and(|exif| has_capture_time(&exif))
}

/// Pointer and offset tags are laid out by the writer itself.
fn is_layout_tag(tag: Tag) -> bool {
    [
        Tag::ExifIFDPointer,
        Tag::GPSInfoIFDPointer,
        Tag::InteropIFDPointer,
        Tag::JPEGInterchangeFormat,
        Tag::JPEGInterchangeFormatLength,
        Tag::StripOffsets,
        Tag::StripByteCounts,
        Tag::TileOffsets,
        Tag::TileByteCounts,
    ]
    .contains(&tag)
}

/// Returns the JPEG bytes with a capture time added, or `None` when the image
/// already has one or is not a JPEG.
pub fn with_capture_time(jpeg: &[u8], stamp: &str) -> Result<Option<Vec<u8>>> {
    let Some(segments) = JpegSegments::parse(jpeg) else {
        return Ok(None);
    };

    let existing = match exif::Reader::new().read_from_container(&mut BufReader::new(Cursor::new(jpeg))) {
        Ok(exif) => Some(exif),
        Err(exif::Error::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    if existing.as_ref().is_some_and(has_capture_time) {
        return Ok(None);
    }

    let original = Field {
        tag: Tag::DateTimeOriginal,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![stamp.as_bytes().to_vec()]),
    };
    let datetime = Field {
        tag: Tag::DateTime,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![stamp.as_bytes().to_vec()]),
    };

    let mut writer = Writer::new();
    let mut has_datetime = false;
    let mut little_endian = true;
    if let Some(exif) = &existing {
        little_endian = exif.little_endian();
        for field in exif.fields() {
            if field.ifd_num != In::PRIMARY
                || is_layout_tag(field.tag)
                || matches!(field.value, Value::Unknown(..))
            {
                continue;
            }
            has_datetime |= field.tag == Tag::DateTime;
            writer.push_field(field);
        }
    }
    writer.push_field(&original);
    if !has_datetime {
        writer.push_field(&datetime);
    }

    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, little_endian)?;
    let tiff = tiff.into_inner();

    let mut payload = Vec::with_capacity(EXIF_HEADER.len() + tiff.len());
    payload.extend_from_slice(EXIF_HEADER);
    payload.extend_from_slice(&tiff);
    if payload.len() + 2 > u16::MAX as usize {
        return Err(exif::Error::TooBig("EXIF block too large for an APP1 segment").into());
    }

    Ok(Some(segments.with_exif(jpeg, &payload)))
}

/// Marker layout of a JPEG up to the start of scan.
struct JpegSegments {
    /// Byte range of an existing EXIF APP1 segment, marker included.
    exif: Option<(usize, usize)>,
    /// Offset right after SOI and any leading APP0 (JFIF) segment.
    insert_at: usize,
}

impl JpegSegments {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
            return None;
        }
        let mut pos = 2;
        let mut exif = None;
        let mut insert_at = 2;
        while pos + 4 <= data.len() {
            if data[pos] != 0xFF {
                return None;
            }
            let marker = data[pos + 1];
            // SOS or EOI: headers are over.
            if marker == 0xDA || marker == 0xD9 {
                break;
            }
            let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let end = pos + 2 + len;
            if len < 2 || end > data.len() {
                return None;
            }
            if marker == 0xE1 && exif.is_none() && data[pos + 4..end].starts_with(EXIF_HEADER) {
                exif = Some((pos, end));
            }
            if marker == 0xE0 && insert_at == pos {
                insert_at = end;
            }
            pos = end;
        }
        Some(Self { exif, insert_at })
    }

    fn with_exif(&self, data: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut segment = Vec::with_capacity(payload.len() + 4);
        segment.extend_from_slice(&[0xFF, 0xE1]);
        segment.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        segment.extend_from_slice(payload);

        let (start, end) = self.exif.unwrap_or((self.insert_at, self.insert_at));
        let mut out = Vec::with_capacity(data.len() + segment.len());
        out.extend_from_slice(&data[..start]);
        out.extend_from_slice(&segment);
        out.extend_from_slice(&data[end..]);
        out
    }
}

// --- MP4 / QuickTime ---

struct BoxHeader {
    kind: [u8; 4],
    start: u64,
    header_len: u64,
    end: u64,
}

fn read_box<R: Read + Seek>(r: &mut R, pos: u64, limit: u64) -> std::io::Result<Option<BoxHeader>> {
    if pos + 8 > limit {
        return Ok(None);
    }
    r.seek(SeekFrom::Start(pos))?;
    let mut head = [0u8; 8];
    r.read_exact(&mut head)?;
    let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as u64;
    let kind = [head[4], head[5], head[6], head[7]];
    let (size, header_len) = match size32 {
        0 => (limit - pos, 8),
        1 => {
            let mut large = [0u8; 8];
            r.read_exact(&mut large)?;
            (u64::from_be_bytes(large), 16)
        }
        n => (n, 8),
    };
    if size < header_len || pos + size > limit {
        return Ok(None);
    }
    Ok(Some(BoxHeader { kind, start: pos, header_len, end: pos + size }))
}

fn find_box<R: Read + Seek>(r: &mut R, from: u64, to: u64, kind: &[u8; 4]) -> std::io::Result<Option<BoxHeader>> {
    let mut pos = from;
    while let Some(header) = read_box(r, pos, to)? {
        if &header.kind == kind {
            return Ok(Some(header));
        }
        pos = header.end;
    }
    Ok(None)
}

/// Writes `mvhd.creation_time` when it holds the zero sentinel. Returns whether
/// the file was changed. The patch is a same-size in-place write.
pub fn patch_mvhd_creation_time(path: &Path, epoch_seconds: u64) -> Result<bool> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();

    let Some(moov) = find_box(&mut file, 0, len, b"moov")? else {
        return Ok(false);
    };
    let Some(mvhd) = find_box(&mut file, moov.start + moov.header_len, moov.end, b"mvhd")? else {
        return Ok(false);
    };

    let field_at = mvhd.start + mvhd.header_len + 4;
    file.seek(SeekFrom::Start(mvhd.start + mvhd.header_len))?;
    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    let mac_time = epoch_seconds + MAC_EPOCH_OFFSET;

    let written = match version[0] {
        0 => match u32::try_from(mac_time) {
            Ok(short) => write_if_zero::<4>(&mut file, field_at, &short.to_be_bytes())?,
            Err(_) => {
                tracing::debug!("Creation time {epoch_seconds} does not fit a version 0 mvhd in {}", path.display());
                false
            }
        },
        1 => write_if_zero::<8>(&mut file, field_at, &mac_time.to_be_bytes())?,
        v => {
            tracing::debug!("Unknown mvhd version {v} in {}", path.display());
            false
        }
    };
    if written {
        file.sync_all()?;
    }
    Ok(written)
}

fn write_if_zero<const N: usize>(file: &mut File, at: u64, value: &[u8; N]) -> std::io::Result<bool> {
    file.seek(SeekFrom::Start(at))?;
    let mut current = [0u8; N];
    file.read_exact(&mut current)?;
    if current.iter().any(|b| *b != 0) {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(at))?;
    file.write_all(value)?;
    Ok(true)
}
