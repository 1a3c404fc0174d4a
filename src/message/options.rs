use std::fmt::{Debug, Formatter};
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::option::{decode_u32, CoapOption, MediaType, OptionId};

/// Nibble value 13: one extension byte, value offset 13.
const EXT_ONE_BYTE: u8 = 13;
/// Nibble value 14: two extension bytes, value offset 269.
const EXT_TWO_BYTES: u8 = 14;
/// Nibble value 15 is reserved; it only occurs as part of the 0xff payload
/// marker byte.
const EXT_RESERVED: u8 = 15;

pub const PAYLOAD_MARKER: u8 = 0xff;

const MAX_PATH_SEGMENT: usize = 255;

/// Ordered CoAP option list.
///
/// Invariant: option ids are non-decreasing, and the relative order of
/// options with equal id is insertion order (it is observable, e.g. as the
/// order of `Uri-Path` segments). All mutators preserve this.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Options {
    items: Vec<CoapOption>,
}

impl Options {
    pub fn new() -> Options {
        Options { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoapOption> {
        self.items.iter()
    }

    /// The half-open index range `[lo, hi)` of the run of options with the
    /// given id, or `None` if there is no such option. Both ends are located
    /// by binary search.
    pub fn find(&self, id: OptionId) -> Option<Range<usize>> {
        let lo = self.items.partition_point(|o| o.id < id);
        let hi = self.items.partition_point(|o| o.id <= id);
        if lo == hi {
            None
        } else {
            Some(lo..hi)
        }
    }

    pub fn has(&self, id: OptionId) -> bool {
        self.find(id).is_some()
    }

    /// First option of the run with the given id.
    pub fn get(&self, id: OptionId) -> Option<&CoapOption> {
        self.find(id).map(|range| &self.items[range.start])
    }

    /// Insert preserving id order; among equal ids the new option is appended
    /// to the end of the run.
    pub fn add(&mut self, opt: CoapOption) {
        let at = self.items.partition_point(|o| o.id <= opt.id);
        self.items.insert(at, opt);
    }

    /// Replace the whole run for the option's id with this single option, at
    /// the position of the run. The stored id is always the one of the passed
    /// option.
    pub fn set(&mut self, opt: CoapOption) {
        match self.find(opt.id) {
            Some(range) => {
                self.items[range.start] = opt;
                self.items.drain(range.start + 1..range.end);
            }
            None => self.add(opt),
        }
    }

    /// Drop the whole run for the id.
    pub fn remove(&mut self, id: OptionId) {
        if let Some(range) = self.find(id) {
            self.items.drain(range);
        }
    }

    pub fn get_u32(&self, id: OptionId) -> Option<u32> {
        self.get(id).and_then(|o| decode_u32(&o.value).ok())
    }

    pub fn set_u32(&mut self, id: OptionId, value: u32) {
        self.set(CoapOption::from_u32(id, value));
    }

    pub fn add_u32(&mut self, id: OptionId, value: u32) {
        self.add(CoapOption::from_u32(id, value));
    }

    pub fn get_bytes(&self, id: OptionId) -> Option<&[u8]> {
        self.get(id).map(|o| o.value.as_ref())
    }

    pub fn set_bytes(&mut self, id: OptionId, value: impl Into<Bytes>) {
        self.set(CoapOption::new(id, value));
    }

    pub fn get_string(&self, id: OptionId) -> Option<String> {
        self.get(id)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
    }

    pub fn set_string(&mut self, id: OptionId, value: &str) {
        self.set(CoapOption::new(id, value.as_bytes().to_vec()));
    }

    /// All values of the run with the given id, in wire order.
    pub fn strings(&self, id: OptionId) -> Vec<String> {
        match self.find(id) {
            Some(range) => self.items[range]
                .iter()
                .map(|o| String::from_utf8_lossy(&o.value).into_owned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn content_format(&self) -> Option<MediaType> {
        self.get_u32(OptionId::CONTENT_FORMAT)
            .map(|v| MediaType(v as u16))
    }

    pub fn set_content_format(&mut self, format: MediaType) {
        self.set_u32(OptionId::CONTENT_FORMAT, format.0 as u32);
    }

    pub fn observe(&self) -> Option<u32> {
        self.get_u32(OptionId::OBSERVE)
    }

    /// Replace all `Uri-Path` options with one option per path segment. A
    /// leading `/` is stripped before splitting; each segment is limited to
    /// 255 bytes.
    pub fn set_path(&mut self, path: &str) -> Result<()> {
        let path = path.strip_prefix('/').unwrap_or(path);

        let segments = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').collect::<Vec<_>>()
        };
        if let Some(long) = segments.iter().find(|s| s.len() > MAX_PATH_SEGMENT) {
            tracing::debug!("path segment of {} bytes exceeds the option limit", long.len());
            return Err(Error::InvalidOptionValue(OptionId::URI_PATH.0));
        }

        self.remove(OptionId::URI_PATH);
        for segment in segments {
            self.add(CoapOption::new(OptionId::URI_PATH, segment.as_bytes().to_vec()));
        }
        Ok(())
    }

    /// Reconstruct `seg0/seg1/...` from the `Uri-Path` options.
    pub fn path(&self) -> String {
        self.strings(OptionId::URI_PATH).join("/")
    }

    /// Total wire size of the encoded option sequence, excluding any payload
    /// marker.
    pub fn encoded_len(&self) -> usize {
        let mut prev = 0u16;
        let mut total = 0;
        for opt in &self.items {
            let delta = (opt.id.0 - prev) as usize;
            total += 1 + ext_len(delta) + ext_len(opt.value.len()) + opt.value.len();
            prev = opt.id.0;
        }
        total
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut prev = 0u16;
        for opt in &self.items {
            let delta = (opt.id.0 - prev) as usize;
            let (delta_nibble, delta_ext) = split_ext(delta);
            let (len_nibble, len_ext) = split_ext(opt.value.len());
            buf.put_u8(delta_nibble << 4 | len_nibble);
            put_ext(buf, delta_nibble, delta_ext);
            put_ext(buf, len_nibble, len_ext);
            buf.put_slice(&opt.value);
            prev = opt.id.0;
        }
    }

    /// Decode an option sequence from the start of `data`, stopping at the
    /// payload marker or the end of input. Returns the options and the number
    /// of bytes consumed (the marker itself is not consumed).
    pub fn decode(data: &[u8]) -> Result<(Options, usize)> {
        let mut options = Options::new();
        let mut prev = 0u32;
        let mut idx = 0;

        while idx < data.len() {
            if data[idx] == PAYLOAD_MARKER {
                break;
            }
            let delta_nibble = data[idx] >> 4;
            let len_nibble = data[idx] & 0x0f;
            if delta_nibble == EXT_RESERVED || len_nibble == EXT_RESERVED {
                return Err(Error::InvalidExtendMarker);
            }
            idx += 1;

            let delta = read_ext(data, &mut idx, delta_nibble)?;
            let len = read_ext(data, &mut idx, len_nibble)?;
            if data.len() - idx < len {
                return Err(Error::OptionTruncated);
            }

            let id = prev + delta as u32;
            if id > u16::MAX as u32 {
                return Err(Error::MalformedOption);
            }
            options.items.push(CoapOption::new(
                OptionId(id as u16),
                Bytes::copy_from_slice(&data[idx..idx + len]),
            ));
            idx += len;
            prev = id;
        }

        Ok((options, idx))
    }
}

impl FromIterator<CoapOption> for Options {
    fn from_iter<T: IntoIterator<Item = CoapOption>>(iter: T) -> Options {
        let mut options = Options::new();
        for opt in iter {
            options.add(opt);
        }
        options
    }
}

impl Debug for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.items).finish()
    }
}

fn ext_len(value: usize) -> usize {
    if value < EXT_ONE_BYTE as usize {
        0
    } else if value < 269 {
        1
    } else {
        2
    }
}

/// Split a delta or length value into its header nibble and extension value.
pub(crate) fn split_ext(value: usize) -> (u8, usize) {
    if value < EXT_ONE_BYTE as usize {
        (value as u8, 0)
    } else if value < 269 {
        (EXT_ONE_BYTE, value - 13)
    } else {
        (EXT_TWO_BYTES, value - 269)
    }
}

pub(crate) fn put_ext(buf: &mut BytesMut, nibble: u8, ext: usize) {
    match nibble {
        EXT_ONE_BYTE => buf.put_u8(ext as u8),
        EXT_TWO_BYTES => buf.put_u16(ext as u16),
        _ => {}
    }
}

/// Resolve a header nibble into the actual delta or length value, advancing
/// `idx` past any extension bytes.
pub(crate) fn read_ext(data: &[u8], idx: &mut usize, nibble: u8) -> Result<usize> {
    match nibble {
        EXT_ONE_BYTE => {
            if data.len() - *idx < 1 {
                return Err(Error::OptionTruncated);
            }
            let value = 13 + data[*idx] as usize;
            *idx += 1;
            Ok(value)
        }
        EXT_TWO_BYTES => {
            if data.len() - *idx < 2 {
                return Err(Error::OptionTruncated);
            }
            let value = 269 + u16::from_be_bytes([data[*idx], data[*idx + 1]]) as usize;
            *idx += 2;
            Ok(value)
        }
        n => Ok(n as usize),
    }
}
