//! Minimal NPY/NPZ serialization for minute archives.
//!
//! An NPZ file is a ZIP archive of NPY members. Members are stored
//! uncompressed; the samples do not compress meaningfully and downstream
//! consumers read them with plain numpy. Only the dtypes this recorder
//! emits are supported: `<c8`, `<f8`, `<u4` and `|S` strings.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use num_complex::Complex32;

use crate::error::{RecorderError, Result};

/// One array value in an NPZ file.
#[derive(Debug, Clone, PartialEq)]
pub enum NpyValue {
    /// complex64 vector (`<c8`)
    C64(Vec<Complex32>),
    /// float64 vector (`<f8`)
    F64(Vec<f64>),
    /// uint32 vector (`<u4`)
    U32(Vec<u32>),
    /// byte string (`|S{n}`), scalar
    Str(String),
}

impl NpyValue {
    pub fn as_f64_scalar(&self) -> Option<f64> {
        match self {
            NpyValue::F64(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_u32_scalar(&self) -> Option<u32> {
        match self {
            NpyValue::U32(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NpyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Write an `.npz` atomically (tmpfile + rename). Member order is
/// preserved.
pub fn write_npz(path: &Path, members: &[(String, NpyValue)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("npz.tmp");
    {
        let mut file = File::create(&tmp)?;
        let bytes = build_zip(members);
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read an `.npz` written by this recorder.
pub fn read_npz(path: &Path) -> Result<HashMap<String, NpyValue>> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    parse_zip(&data)
}

// ---- NPY encoding ----

fn npy_bytes(value: &NpyValue) -> Vec<u8> {
    let (descr, shape, payload): (String, String, Vec<u8>) = match value {
        NpyValue::C64(v) => {
            let mut p = Vec::with_capacity(v.len() * 8);
            for z in v {
                let mut b = [0u8; 8];
                LittleEndian::write_f32(&mut b[0..4], z.re);
                LittleEndian::write_f32(&mut b[4..8], z.im);
                p.extend_from_slice(&b);
            }
            ("<c8".into(), format!("({},)", v.len()), p)
        }
        NpyValue::F64(v) => {
            let mut p = Vec::with_capacity(v.len() * 8);
            for x in v {
                let mut b = [0u8; 8];
                LittleEndian::write_f64(&mut b, *x);
                p.extend_from_slice(&b);
            }
            ("<f8".into(), format!("({},)", v.len()), p)
        }
        NpyValue::U32(v) => {
            let mut p = Vec::with_capacity(v.len() * 4);
            for x in v {
                let mut b = [0u8; 4];
                LittleEndian::write_u32(&mut b, *x);
                p.extend_from_slice(&b);
            }
            ("<u4".into(), format!("({},)", v.len()), p)
        }
        NpyValue::Str(s) => {
            let bytes = s.as_bytes().to_vec();
            (format!("|S{}", bytes.len().max(1)), "()".into(), {
                if bytes.is_empty() {
                    vec![0]
                } else {
                    bytes
                }
            })
        }
    };

    let dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    // Magic(6) + version(2) + header-len(2) + dict + '\n', padded to 64
    let unpadded = 10 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = (dict.len() + padding + 1) as u16;

    let mut out = Vec::with_capacity(10 + header_len as usize + payload.len());
    out.extend_from_slice(b"\x93NUMPY\x01\x00");
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    out.extend_from_slice(&payload);
    out
}

fn parse_npy(data: &[u8]) -> Result<NpyValue> {
    if data.len() < 10 || &data[0..6] != b"\x93NUMPY" {
        return Err(RecorderError::Fatal("bad npy magic".into()));
    }
    let header_len = u16::from_le_bytes([data[8], data[9]]) as usize;
    let header_end = 10 + header_len;
    if data.len() < header_end {
        return Err(RecorderError::Fatal("truncated npy header".into()));
    }
    let header = String::from_utf8_lossy(&data[10..header_end]);
    let payload = &data[header_end..];

    let descr = extract_quoted(&header, "'descr':")
        .ok_or_else(|| RecorderError::Fatal("npy header missing descr".into()))?;

    if let Some(len_str) = descr.strip_prefix("|S") {
        let len: usize = len_str
            .parse()
            .map_err(|_| RecorderError::Fatal("bad string dtype".into()))?;
        let raw = payload.get(..len).unwrap_or(payload);
        let s = String::from_utf8_lossy(raw)
            .trim_end_matches('\0')
            .to_string();
        return Ok(NpyValue::Str(s));
    }

    match descr.as_str() {
        "<c8" => {
            let n = payload.len() / 8;
            let mut v = Vec::with_capacity(n);
            for k in 0..n {
                v.push(Complex32::new(
                    LittleEndian::read_f32(&payload[8 * k..]),
                    LittleEndian::read_f32(&payload[8 * k + 4..]),
                ));
            }
            Ok(NpyValue::C64(v))
        }
        "<f8" => {
            let n = payload.len() / 8;
            Ok(NpyValue::F64(
                (0..n)
                    .map(|k| LittleEndian::read_f64(&payload[8 * k..]))
                    .collect(),
            ))
        }
        "<u4" => {
            let n = payload.len() / 4;
            Ok(NpyValue::U32(
                (0..n)
                    .map(|k| LittleEndian::read_u32(&payload[4 * k..]))
                    .collect(),
            ))
        }
        other => Err(RecorderError::Fatal(format!(
            "unsupported npy dtype {:?}",
            other
        ))),
    }
}

fn extract_quoted(header: &str, key: &str) -> Option<String> {
    let at = header.find(key)? + key.len();
    let rest = &header[at..];
    let open = rest.find('\'')? + 1;
    let close = rest[open..].find('\'')? + open;
    Some(rest[open..close].to_string())
}

// ---- ZIP container (stored entries) ----

fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

fn build_zip(members: &[(String, NpyValue)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    let mut count = 0u16;

    for (name, value) in members {
        let file_name = format!("{}.npy", name);
        let body = npy_bytes(value);
        let crc = crc32(&body);
        let offset = out.len() as u32;

        // Local file header
        out.extend_from_slice(&0x04034b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // method: stored
        out.extend_from_slice(&0u16.to_le_bytes()); // mod time
        out.extend_from_slice(&0u16.to_le_bytes()); // mod date
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(file_name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // extra len
        out.extend_from_slice(file_name.as_bytes());
        out.extend_from_slice(&body);

        // Central directory entry
        central.extend_from_slice(&0x02014b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes()); // version made by
        central.extend_from_slice(&20u16.to_le_bytes()); // version needed
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(body.len() as u32).to_le_bytes());
        central.extend_from_slice(&(body.len() as u32).to_le_bytes());
        central.extend_from_slice(&(file_name.len() as u16).to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes()); // extra
        central.extend_from_slice(&0u16.to_le_bytes()); // comment
        central.extend_from_slice(&0u16.to_le_bytes()); // disk
        central.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        central.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(file_name.as_bytes());

        count += 1;
    }

    let central_offset = out.len() as u32;
    let central_size = central.len() as u32;
    out.extend_from_slice(&central);

    // End of central directory
    out.extend_from_slice(&0x06054b50u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // disk
    out.extend_from_slice(&0u16.to_le_bytes()); // start disk
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&central_size.to_le_bytes());
    out.extend_from_slice(&central_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // comment len

    out
}

fn parse_zip(data: &[u8]) -> Result<HashMap<String, NpyValue>> {
    let mut out = HashMap::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let sig = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        if sig != 0x04034b50 {
            break; // central directory reached
        }
        if pos + 30 > data.len() {
            return Err(RecorderError::Fatal("truncated zip local header".into()));
        }
        let method = u16::from_le_bytes([data[pos + 8], data[pos + 9]]);
        let size = u32::from_le_bytes([
            data[pos + 18],
            data[pos + 19],
            data[pos + 20],
            data[pos + 21],
        ]) as usize;
        let name_len = u16::from_le_bytes([data[pos + 26], data[pos + 27]]) as usize;
        let extra_len = u16::from_le_bytes([data[pos + 28], data[pos + 29]]) as usize;

        if method != 0 {
            return Err(RecorderError::Fatal(
                "unsupported zip compression method".into(),
            ));
        }

        let name_start = pos + 30;
        let body_start = name_start + name_len + extra_len;
        if body_start + size > data.len() {
            return Err(RecorderError::Fatal("truncated zip member".into()));
        }
        let raw_name = String::from_utf8_lossy(&data[name_start..name_start + name_len]);
        let name = raw_name.trim_end_matches(".npy").to_string();
        let value = parse_npy(&data[body_start..body_start + size])?;
        out.insert(name, value);

        pos = body_start + size;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_dtypes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.npz");

        let members = vec![
            (
                "iq".to_string(),
                NpyValue::C64(vec![
                    Complex32::new(1.0, -2.0),
                    Complex32::new(0.5, 0.25),
                ]),
            ),
            ("unix_timestamp".to_string(), NpyValue::F64(vec![1.5e9])),
            ("gaps".to_string(), NpyValue::U32(vec![3, 4, 5])),
            ("source".to_string(), NpyValue::Str("wwv".into())),
        ];
        write_npz(&path, &members).unwrap();

        let back = read_npz(&path).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back["iq"], members[0].1);
        assert_eq!(back["unix_timestamp"].as_f64_scalar(), Some(1.5e9));
        assert_eq!(back["gaps"], NpyValue::U32(vec![3, 4, 5]));
        assert_eq!(back["source"].as_str(), Some("wwv"));
    }

    #[test]
    fn test_empty_arrays_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.npz");
        let members = vec![("gap_rtp_timestamps".to_string(), NpyValue::U32(vec![]))];
        write_npz(&path, &members).unwrap();
        let back = read_npz(&path).unwrap();
        assert_eq!(back["gap_rtp_timestamps"], NpyValue::U32(vec![]));
    }

    #[test]
    fn test_npy_header_is_aligned() {
        let bytes = npy_bytes(&NpyValue::F64(vec![0.0]));
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
    }

    #[test]
    fn test_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npz");
        write_npz(&path, &[("x".into(), NpyValue::U32(vec![1]))]).unwrap();
        // No tmp file left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
