//! Bit-exact LGMP wire structures.
//!
//! Every type here is parsed and serialized field-by-field in explicit
//! little-endian order rather than `repr(C)` + transmute: the region is
//! untrusted memory shared with a process in another address space, so every
//! offset is bounds-checked before it is read, and we never want Rust's
//! struct layout rules (padding, alignment) to leak into the wire contract.

use byteorder::{ByteOrder, LittleEndian};
use std::ffi::CString;

/// Fixed 8-byte magic at the start of the header. No trailing NUL; this is a
/// literal byte string, not a C string.
pub const MAGIC: &[u8; 8] = b"KVMFR---";

/// Wire version this crate speaks. A host advertising any other value is
/// [`crate::session::SessionError::InvalidVersion`].
pub const VERSION: u32 = 19;

/// Feature bit: the host accepts `SetCursorPos` messages on the pointer queue.
pub const FEATURE_SET_CURSOR_POS: u32 = 0x1;

/// Queue identifiers as published by the host header (not array indices).
pub const LGMP_Q_POINTER: u32 = 1;
pub const LGMP_Q_FRAME: u32 = 2;

/// Fixed slot counts per §3 of the spec.
pub const LGMP_Q_FRAME_LEN: u32 = 2;
pub const LGMP_Q_POINTER_LEN: u32 = 20;

pub const MAX_DAMAGE_RECTS: usize = 64;

pub const HOSTVER_LEN: usize = 32;

/// `KVMFRRecord` type tags.
pub const RECORD_VMINFO: u8 = 1;
pub const RECORD_OSINFO: u8 = 2;

/// Outbound message type tag for `SetCursorPos` (the only client->host message).
pub const MESSAGE_SET_CURSOR_POS: u32 = 0;

/// Cursor payload flags, carried in the pointer message's `user-tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorFlags(pub u32);

impl CursorFlags {
    pub const POSITION: u32 = 0x1;
    pub const VISIBLE: u32 = 0x2;
    pub const SHAPE: u32 = 0x4;

    pub fn position(self) -> bool {
        self.0 & Self::POSITION != 0
    }
    pub fn visible(self) -> bool {
        self.0 & Self::VISIBLE != 0
    }
    pub fn shape(self) -> bool {
        self.0 & Self::SHAPE != 0
    }
}

/// Frame payload flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(pub u32);

impl FrameFlags {
    pub const BLOCK_SCREENSAVER: u32 = 0x1;
    pub const REQUEST_ACTIVATION: u32 = 0x2;
    pub const TRUNCATED: u32 = 0x4;

    pub fn block_screensaver(self) -> bool {
        self.0 & Self::BLOCK_SCREENSAVER != 0
    }
    pub fn request_activation(self) -> bool {
        self.0 & Self::REQUEST_ACTIVATION != 0
    }
    pub fn truncated(self) -> bool {
        self.0 & Self::TRUNCATED != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Bgra,
    Rgba,
    Rgba10,
    Rgba16F,
}

impl FrameType {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Bgra),
            1 => Some(Self::Rgba),
            2 => Some(Self::Rgba10),
            3 => Some(Self::Rgba16F),
            _ => None,
        }
    }

    /// Bits per pixel: 32 for every format except `RGBA16F`, which is 64 (§3).
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            FrameType::Rgba16F => 64,
            _ => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl FrameRotation {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Deg0),
            1 => Some(Self::Deg90),
            2 => Some(Self::Deg180),
            3 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            FrameRotation::Deg0 => 0,
            FrameRotation::Deg90 => 90,
            FrameRotation::Deg180 => 180,
            FrameRotation::Deg270 => 270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    Color,
    Monochrome,
    MaskedColor,
}

impl CursorType {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Color),
            1 => Some(Self::Monochrome),
            2 => Some(Self::MaskedColor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DamageRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl DamageRect {
    pub const WIRE_SIZE: usize = 16;

    fn decode(buf: &[u8]) -> Self {
        Self {
            x: LittleEndian::read_u32(&buf[0..4]),
            y: LittleEndian::read_u32(&buf[4..8]),
            w: LittleEndian::read_u32(&buf[8..12]),
            h: LittleEndian::read_u32(&buf[12..16]),
        }
    }
}

/// Parsed `KVMFRFrame` descriptor (payload of a FRAME message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub format_ver: u32,
    pub frame_serial: u32,
    pub frame_type_raw: u32,
    pub screen_w: u32,
    pub screen_h: u32,
    pub frame_w: u32,
    pub frame_h: u32,
    pub rotation_raw: u32,
    pub stride: u32,
    pub pitch: u32,
    /// Offset from the start of this descriptor to the pixel buffer.
    pub offset: u32,
    pub damage_rects_count: u32,
    pub damage_rects: Vec<DamageRect>,
    pub flags: FrameFlags,
}

/// Minimum byte length of a `FrameDescriptor` before the fixed damage-rect table:
/// formatVer, frameSerial, type, screenW, screenH, frameW, frameH, rotation,
/// stride, pitch, offset, damageRectsCount — 12 fields.
const FRAME_FIXED_LEN: usize = 4 * 12;
const FRAME_DAMAGE_TABLE_LEN: usize = MAX_DAMAGE_RECTS * DamageRect::WIRE_SIZE;
const FRAME_FLAGS_LEN: usize = 4;
pub const FRAME_DESCRIPTOR_WIRE_SIZE: usize =
    FRAME_FIXED_LEN + FRAME_DAMAGE_TABLE_LEN + FRAME_FLAGS_LEN;

impl FrameDescriptor {
    /// Decode a frame descriptor from a payload slice. `damageRectsCount` above
    /// [`MAX_DAMAGE_RECTS`] is rejected per §8's boundary behaviors.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_DESCRIPTOR_WIRE_SIZE {
            return None;
        }

        let format_ver = LittleEndian::read_u32(&buf[0..4]);
        let frame_serial = LittleEndian::read_u32(&buf[4..8]);
        let frame_type_raw = LittleEndian::read_u32(&buf[8..12]);
        let screen_w = LittleEndian::read_u32(&buf[12..16]);
        let screen_h = LittleEndian::read_u32(&buf[16..20]);
        let frame_w = LittleEndian::read_u32(&buf[20..24]);
        let frame_h = LittleEndian::read_u32(&buf[24..28]);
        let rotation_raw = LittleEndian::read_u32(&buf[28..32]);
        let stride = LittleEndian::read_u32(&buf[32..36]);
        let pitch = LittleEndian::read_u32(&buf[36..40]);
        let offset = LittleEndian::read_u32(&buf[40..44]);
        let damage_rects_count = LittleEndian::read_u32(&buf[44..48]);

        if damage_rects_count as usize > MAX_DAMAGE_RECTS {
            return None;
        }

        let mut damage_rects = Vec::with_capacity(damage_rects_count as usize);
        let table = &buf[FRAME_FIXED_LEN..FRAME_FIXED_LEN + FRAME_DAMAGE_TABLE_LEN];
        for i in 0..damage_rects_count as usize {
            let rect_buf = &table[i * DamageRect::WIRE_SIZE..(i + 1) * DamageRect::WIRE_SIZE];
            damage_rects.push(DamageRect::decode(rect_buf));
        }

        let flags_off = FRAME_FIXED_LEN + FRAME_DAMAGE_TABLE_LEN;
        let flags = FrameFlags(LittleEndian::read_u32(&buf[flags_off..flags_off + 4]));

        Some(Self {
            format_ver,
            frame_serial,
            frame_type_raw,
            screen_w,
            screen_h,
            frame_w,
            frame_h,
            rotation_raw,
            stride,
            pitch,
            offset,
            damage_rects_count,
            damage_rects,
            flags,
        })
    }
}

/// Parsed `KVMFRCursor` descriptor (payload of a POINTER message), excluding
/// the trailing shape bytes which the caller slices out separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorDescriptor {
    pub x: i16,
    pub y: i16,
    pub cursor_type_raw: u32,
    pub hx: i8,
    pub hy: i8,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// `KVMFRCursor` carries 2 bytes of alignment padding between `hy` (offset 9)
/// and `width` (offset 12) — the host writes this as a raw C struct, so the
/// compiler's alignment of the `u32` fields after two `i8`s leaves a gap we
/// have to skip rather than pack around.
const CURSOR_PAD_LEN: usize = 2;

pub const CURSOR_DESCRIPTOR_WIRE_SIZE: usize = 2 + 2 + 4 + 1 + 1 + CURSOR_PAD_LEN + 4 + 4 + 4;

impl CursorDescriptor {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CURSOR_DESCRIPTOR_WIRE_SIZE {
            return None;
        }
        Some(Self {
            x: LittleEndian::read_i16(&buf[0..2]),
            y: LittleEndian::read_i16(&buf[2..4]),
            cursor_type_raw: LittleEndian::read_u32(&buf[4..8]),
            hx: buf[8] as i8,
            hy: buf[9] as i8,
            width: LittleEndian::read_u32(&buf[12..16]),
            height: LittleEndian::read_u32(&buf[16..20]),
            pitch: LittleEndian::read_u32(&buf[20..24]),
        })
    }

    /// Required shape-byte length for this descriptor's declared dimensions.
    pub fn required_shape_len(&self) -> u64 {
        self.height as u64 * self.pitch as u64
    }
}

/// The single client->host message: a cursor-warp request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCursorPos {
    pub x: i32,
    pub y: i32,
}

pub const SET_CURSOR_POS_WIRE_SIZE: usize = 4 + 4 + 4;

impl SetCursorPos {
    pub fn encode(self) -> [u8; SET_CURSOR_POS_WIRE_SIZE] {
        let mut buf = [0u8; SET_CURSOR_POS_WIRE_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], MESSAGE_SET_CURSOR_POS);
        LittleEndian::write_i32(&mut buf[4..8], self.x);
        LittleEndian::write_i32(&mut buf[8..12], self.y);
        buf
    }
}

/// A guest OS identity record (`KVMFR_RECORD_OSINFO`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub os: u8,
    pub name: CString,
}

/// A guest VM info record (`KVMFR_RECORD_VMINFO`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub uuid: [u8; 16],
    pub capture: [u8; 32],
    pub cpus: u8,
    pub cores: u8,
    pub sockets: u8,
    pub model: CString,
}

/// A decoded TLV record from the header's trailing area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    VmInfo(VmInfo),
    OsInfo(OsInfo),
    /// A record type we don't recognize; carried so callers can see raw bytes
    /// if they need to, without us guessing at its shape.
    Unknown { record_type: u8, data: Vec<u8> },
}

/// Find a NUL terminator within `buf`, or treat the whole slice as unterminated.
fn take_cstring(buf: &[u8]) -> CString {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    // SAFETY-free: CString::new rejects interior NULs, which can't happen
    // since `end` is the first NUL.
    CString::new(&buf[..end]).unwrap_or_default()
}

impl Record {
    /// Decode one TLV record starting at `buf[0]`. Returns the record and the
    /// number of bytes it consumed (`1 + 4 + size`), or `None` if `buf` is too
    /// short to hold even the type+size prefix, or the declared size would
    /// run past the end of `buf`.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 5 {
            return None;
        }
        let record_type = buf[0];
        let size = LittleEndian::read_u32(&buf[1..5]) as usize;
        let total = 5 + size;
        if buf.len() < total {
            return None;
        }
        let data = &buf[5..total];

        let record = match record_type {
            RECORD_VMINFO if data.len() >= 16 + 32 + 3 => Record::VmInfo(VmInfo {
                uuid: data[0..16].try_into().unwrap(),
                capture: data[16..48].try_into().unwrap(),
                cpus: data[48],
                cores: data[49],
                sockets: data[50],
                model: take_cstring(&data[51..]),
            }),
            RECORD_OSINFO if !data.is_empty() => Record::OsInfo(OsInfo {
                os: data[0],
                name: take_cstring(&data[1..]),
            }),
            _ => Record::Unknown {
                record_type,
                data: data.to_vec(),
            },
        };

        Some((record, total))
    }
}

/// Parse the TLV record stream starting right after the fixed header fields,
/// stopping at the first record that would read past `buf`'s end rather than
/// failing the whole session: the fixed header already validated magic and
/// version, so a truncated trailing record is not grounds to distrust those.
pub fn decode_records(mut buf: &[u8]) -> Vec<Record> {
    let mut out = Vec::new();
    while let Some((record, consumed)) = Record::decode(buf) {
        out.push(record);
        buf = &buf[consumed..];
    }
    out
}

/// Fixed-size prefix of the LGMP header (magic, version, hostver, features).
/// TLV records, if any, follow immediately after `HEADER_FIXED_SIZE` bytes.
pub const HEADER_FIXED_SIZE: usize = 8 + 4 + HOSTVER_LEN + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFixed {
    pub magic: [u8; 8],
    pub version: u32,
    pub hostver: CString,
    pub features: u32,
}

impl HeaderFixed {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_FIXED_SIZE {
            return None;
        }
        let magic: [u8; 8] = buf[0..8].try_into().unwrap();
        let version = LittleEndian::read_u32(&buf[8..12]);
        let hostver = take_cstring(&buf[12..12 + HOSTVER_LEN]);
        let features = LittleEndian::read_u32(&buf[12 + HOSTVER_LEN..HEADER_FIXED_SIZE]);
        Some(Self {
            magic,
            version,
            hostver,
            features,
        })
    }
}
