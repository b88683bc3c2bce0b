//! DMS (Disk Masher System) archive reader.
//!
//! DMS was the de-facto way to distribute Amiga floppy disks in the late
//! 1980s and 1990s. An archive holds a file header followed by one record per
//! disk track, each compressed with one of seven modes. This crate decodes
//! those records back into a raw ADF disk image, byte for byte.
//!
//! # Compression Modes
//!
//! - **NOCOMP** (0) - Stored
//! - **SIMPLE** (1) - Run-length encoding
//! - **QUICK** (2) - LZ77 over a 256-byte window
//! - **MEDIUM** (3) - LZ77 over a 16 KiB window
//! - **DEEP** (4) - LZ77 with adaptive Huffman coding
//! - **HEAVY1** / **HEAVY2** (5/6) - LZ77 with canonical Huffman tables
//!
//! Every LZ mode may be followed by a run-length stage. All coders share one
//! dictionary whose contents survive from one track to the next unless the
//! track asks for a reset.
//!
//! # Example
//!
//! ```no_run
//! use dms::UnpackOptions;
//!
//! let data = std::fs::read("workbench.dms").unwrap();
//! if dms::detect(&data) {
//!     let image = dms::decompress_to_vec(&data, &UnpackOptions::new()).unwrap();
//!     std::fs::write("workbench.adf", &image.data).unwrap();
//!     if let Some(banner) = image.side_channels.banner_text() {
//!         println!("{}", banner);
//!     }
//! }
//! ```

use encoding_rs::WINDOWS_1252;
use log::{debug, warn};
use thiserror::Error;

/// Errors that can occur while reading a DMS archive.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmsError {
    /// The buffer does not start with the `DMS!` signature.
    #[error("Not a DMS file")]
    NotAnArchive,

    /// The archive ends in the middle of a structure.
    #[error("Unexpected end of data")]
    TruncatedInput,

    /// The 56-byte file header failed its CRC check.
    #[error("File header CRC error")]
    HeaderCrcMismatch,

    /// A track declares a length beyond the 32000-byte track buffer.
    #[error("Track data too large")]
    TrackTooLarge,

    /// A track header failed its CRC check.
    #[error("Track header CRC error")]
    TrackHeaderCrcMismatch,

    /// A track payload failed its CRC check.
    #[error("Track data CRC error")]
    TrackPayloadCrcMismatch,

    /// A decoded track does not match its additive checksum.
    #[error("Track checksum error")]
    ChecksumMismatch,

    /// A coder rejected its input.
    #[error("Decompression error: {0}")]
    DecodeFailure(#[from] DecodeFault),

    /// A track uses a compression mode outside 0..=6.
    #[error("Unknown compression mode: {0}")]
    UnknownCompressionMode(u8),

    /// The archive is encrypted and no password was supplied.
    #[error("Encrypted, no password given")]
    NoPassphraseForEncrypted,

    /// The archive is encrypted and the password does not decode it.
    #[error("Wrong password")]
    WrongPassphrase,

    /// The archive packs FMS files rather than a disk image.
    #[error("FMS archive (not a disk image)")]
    UnsupportedArchiveKind,

    /// The caller's output buffer cannot hold the next track.
    #[error("Output buffer full")]
    OutputBufferFull,
}

/// Reasons a coder gave up on a track payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFault {
    /// The coder needed more bits than the payload holds.
    #[error("packed data exhausted")]
    InputExhausted,

    /// A run-length token overshoots the declared track length.
    #[error("run overflows the track")]
    RunOverflow,

    /// A table transmits more code lengths than it has symbols.
    #[error("table declares {0} code lengths")]
    TableTooLarge(usize),

    /// A degenerate table names a symbol outside its alphabet.
    #[error("invalid symbol {0}")]
    InvalidSymbol(u16),

    /// A Huffman code does not resolve to a symbol.
    #[error("malformed Huffman code")]
    BadCode,

    /// A transmitted code-length table cannot be turned into a code.
    #[error("invalid Huffman table: {0}")]
    Table(#[from] TableError),
}

/// Ways a canonical Huffman code-length table can be malformed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Code words run past the end of the lookup table.
    #[error("code words overflow the lookup table")]
    CodeOverflow,

    /// A code is deeper than the builder allows.
    #[error("code depth exceeds 32")]
    DepthExceeded,

    /// The tree needs more internal nodes than the alphabet permits.
    #[error("too many internal nodes")]
    NodeOverflow,

    /// The code words do not exactly fill the lookup table.
    #[error("code words do not fill the lookup table")]
    Incomplete,
}

/// Length of the file header.
pub const HEADER_LEN: usize = 56;
/// Length of a track header.
pub const TRACK_HEADER_LEN: usize = 20;
/// Largest packed or unpacked track the format allows.
pub const TRACK_BUFFER_LEN: usize = 32000;

/// Track number carrying the archive banner.
pub const BANNER_TRACK: u16 = 0xFFFF;
/// Track number carrying the FILEID.DIZ description. Never encrypted.
pub const FILEID_TRACK: u16 = 80;

/// Disk type code of FMS archives, which carry files instead of a disk.
pub const DISK_TYPE_FMS: u16 = 7;

/// General info flags (file header bytes 10-11).
pub mod info {
    pub const NO_ZERO: u16 = 0x0001;
    pub const ENCRYPTED: u16 = 0x0002;
    pub const APPENDS: u16 = 0x0004;
    pub const BANNER: u16 = 0x0008;
    pub const HIGH_DENSITY: u16 = 0x0010;
    pub const PC_DISK: u16 = 0x0020;
    pub const DEVICE_FIX: u16 = 0x0040;
    pub const REGISTERED: u16 = 0x0080;
    pub const FILEID_DIZ: u16 = 0x0100;

    pub(crate) const NAMES: [(u16, &str); 9] = [
        (NO_ZERO, "NOZERO"),
        (ENCRYPTED, "ENCRYPTED"),
        (APPENDS, "APPENDS"),
        (BANNER, "BANNER"),
        (HIGH_DENSITY, "HIGHDENSITY"),
        (PC_DISK, "PC"),
        (DEVICE_FIX, "DEVICEFIX"),
        (REGISTERED, "REGISTERED"),
        (FILEID_DIZ, "FILEID.DIZ"),
    ];
}

/// Track flags (track header byte 12).
pub mod track_flags {
    /// Keep the coder state for the next track instead of resetting it.
    pub const KEEP_STATE: u8 = 0x01;
    /// HEAVY modes: new Huffman tables precede the data.
    pub const NEW_TABLES: u8 = 0x02;
    /// HEAVY modes: a run-length stage follows the LZ stage.
    pub const RLE_STAGE: u8 = 0x04;
    pub(crate) const LARGE_WINDOW: u8 = 0x08;
}

const MAGIC: &[u8; 4] = b"DMS!";
const TRACK_MAGIC: &[u8; 2] = b"TR";

/// Track numbers below this carry disk data.
const DATA_TRACKS: u16 = 80;
/// Track 0 records this small are fake boot blocks.
const DECOY_LEN: u16 = 2048;
/// Extra records tolerated beyond twice the declared track range.
const RECORD_SLACK: usize = 16;

// --- Integrity ---

const CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// IBM CRC-16 (polynomial 0xA001, reflected), as used for every DMS header
/// and payload.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        CRC_TABLE[usize::from((crc ^ u16::from(b)) & 0xFF)] ^ (crc >> 8)
    })
}

/// Additive 16-bit checksum of decoded track data.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u24_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([0, data[offset], data[offset + 1], data[offset + 2]])
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

// --- Names ---

/// Compression mode of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    NoComp,
    Simple,
    Quick,
    Medium,
    Deep,
    Heavy1,
    Heavy2,
}

impl CompressionMode {
    /// Map a mode code to its variant.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::NoComp),
            1 => Some(Self::Simple),
            2 => Some(Self::Quick),
            3 => Some(Self::Medium),
            4 => Some(Self::Deep),
            5 => Some(Self::Heavy1),
            6 => Some(Self::Heavy2),
            _ => None,
        }
    }

    /// The name DMS itself prints for this mode.
    pub fn name(self) -> &'static str {
        match self {
            Self::NoComp => "NOCOMP",
            Self::Simple => "SIMPLE",
            Self::Quick => "QUICK",
            Self::Medium => "MEDIUM",
            Self::Deep => "DEEP",
            Self::Heavy1 => "HEAVY1",
            Self::Heavy2 => "HEAVY2",
        }
    }
}

/// Display name of a compression mode code.
pub fn compression_mode_name(code: u16) -> &'static str {
    CompressionMode::from_code(code).map_or("Unknown", CompressionMode::name)
}

/// Display name of a disk type code.
pub fn disk_type_name(disk_type: u16) -> &'static str {
    match disk_type {
        0 | 1 => "AmigaOS 1.x OFS",
        2 => "AmigaOS 2.0+ FFS",
        3 => "AmigaOS 3.0 OFS/International",
        4 => "AmigaOS 3.0 FFS/International",
        5 => "AmigaOS 3.0 OFS/DirCache",
        6 => "AmigaOS 3.0 FFS/DirCache",
        7 => "FMS System File",
        _ => "Unknown",
    }
}

// --- File header ---

/// Parsed DMS file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderInfo {
    /// General info flags, see [`info`].
    pub general_info: u16,
    /// Creation time in seconds since the Unix epoch.
    pub created: u32,
    /// Lowest track number in the archive.
    pub track_lo: u16,
    /// Highest track number in the archive.
    pub track_hi: u16,
    /// Total packed size as recorded by the creator.
    pub packed_size: u32,
    /// Total unpacked size as recorded by the creator.
    pub unpacked_size: u32,
    /// Version of the tool that made the archive (e.g. 111 for 1.11).
    pub creator_version: u16,
    /// Disk type code, see [`disk_type_name`].
    pub disk_type: u16,
    /// Compression mode the creator was asked to use.
    pub compression_mode: u16,
}

impl HeaderInfo {
    fn parse(b: &[u8]) -> Self {
        Self {
            general_info: read_u16_be(b, 10),
            created: read_u32_be(b, 12),
            track_lo: read_u16_be(b, 16),
            track_hi: read_u16_be(b, 18),
            packed_size: read_u24_be(b, 21),
            unpacked_size: read_u24_be(b, 25),
            creator_version: read_u16_be(b, 46),
            disk_type: read_u16_be(b, 50),
            compression_mode: read_u16_be(b, 52),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.general_info & info::ENCRYPTED != 0
    }

    pub fn has_banner(&self) -> bool {
        self.general_info & info::BANNER != 0
    }

    pub fn has_file_id(&self) -> bool {
        self.general_info & info::FILEID_DIZ != 0
    }

    pub fn is_high_density(&self) -> bool {
        self.general_info & info::HIGH_DENSITY != 0
    }

    pub fn disk_type_name(&self) -> &'static str {
        disk_type_name(self.disk_type)
    }

    pub fn compression_mode_name(&self) -> &'static str {
        compression_mode_name(self.compression_mode)
    }

    /// Names of the general info flags that are set.
    pub fn flag_names(&self) -> Vec<&'static str> {
        info::NAMES
            .iter()
            .filter(|(bit, _)| self.general_info & bit != 0)
            .map(|&(_, name)| name)
            .collect()
    }

    /// Number of tracks in the declared range.
    pub fn declared_tracks(&self) -> usize {
        usize::from(self.track_hi.saturating_sub(self.track_lo)) + 1
    }

    /// Output size that fits every track this archive can emit.
    pub fn image_capacity(&self) -> usize {
        let tracks = self.declared_tracks().min(usize::from(DATA_TRACKS));
        (tracks * TRACK_BUFFER_LEN).max(self.unpacked_size as usize)
    }

    fn record_limit(&self) -> usize {
        self.declared_tracks() * 2 + RECORD_SLACK
    }
}

/// Returns true if `data` starts with a valid DMS file header.
pub fn detect(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && &data[..4] == MAGIC && header_crc_ok(data)
}

fn header_crc_ok(data: &[u8]) -> bool {
    read_u16_be(data, HEADER_LEN - 2) == crc16(&data[4..HEADER_LEN - 2])
}

/// Parse and validate the file header.
pub fn read_header_info(data: &[u8]) -> Result<HeaderInfo, DmsError> {
    if data.len() < HEADER_LEN {
        return Err(DmsError::TruncatedInput);
    }
    if &data[..4] != MAGIC {
        return Err(DmsError::NotAnArchive);
    }
    if !header_crc_ok(data) {
        return Err(DmsError::HeaderCrcMismatch);
    }
    Ok(HeaderInfo::parse(&data[..HEADER_LEN]))
}

// --- Track header ---

/// A parsed 20-byte track header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackHeader {
    /// Track number, or [`BANNER_TRACK`] / [`FILEID_TRACK`].
    pub number: u16,
    /// Bytes of payload following the header.
    pub packed_len: u16,
    /// Output length of the first stage (input of the run-length stage).
    pub stage_len: u16,
    /// Final decoded length.
    pub unpacked_len: u16,
    /// Track flags, see [`track_flags`].
    pub flags: u8,
    /// Compression mode code.
    pub mode: u8,
    /// Additive checksum of the decoded track.
    pub checksum: u16,
    /// CRC-16 of the packed payload.
    pub data_crc: u16,
    /// CRC-16 of header bytes 0..18.
    pub header_crc: u16,
}

impl TrackHeader {
    fn parse(b: &[u8]) -> Self {
        Self {
            number: read_u16_be(b, 2),
            packed_len: read_u16_be(b, 6),
            stage_len: read_u16_be(b, 8),
            unpacked_len: read_u16_be(b, 10),
            flags: b[12],
            mode: b[13],
            checksum: read_u16_be(b, 14),
            data_crc: read_u16_be(b, 16),
            header_crc: read_u16_be(b, 18),
        }
    }

    fn fits_track_buffer(&self) -> bool {
        [self.packed_len, self.stage_len, self.unpacked_len]
            .iter()
            .all(|&len| usize::from(len) <= TRACK_BUFFER_LEN)
    }

    pub fn mode_name(&self) -> &'static str {
        compression_mode_name(u16::from(self.mode))
    }
}

/// Diagnostic record passed to the track callback for every data track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackReport {
    pub header: TrackHeader,
    /// The payload matched its CRC.
    pub crc_ok: bool,
    /// The coder finished without error.
    pub decoded: bool,
    /// The decoded data matched its checksum.
    pub checksum_ok: bool,
}

// --- Side channels ---

/// Text tracks that travel with the disk image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideChannels {
    /// Banner shown by DMS when the archive is unpacked.
    pub banner: Option<Vec<u8>>,
    /// FILEID.DIZ description.
    pub file_id: Option<Vec<u8>>,
}

impl SideChannels {
    /// Drop both buffers. Calling it again is harmless.
    pub fn release(&mut self) {
        self.banner = None;
        self.file_id = None;
    }

    pub fn is_empty(&self) -> bool {
        self.banner.is_none() && self.file_id.is_none()
    }

    /// The banner decoded as Amiga (ISO-8859-1) text.
    pub fn banner_text(&self) -> Option<String> {
        self.banner.as_deref().map(decode_amiga_text)
    }

    /// FILEID.DIZ decoded as Amiga (ISO-8859-1) text.
    pub fn file_id_text(&self) -> Option<String> {
        self.file_id.as_deref().map(decode_amiga_text)
    }
}

fn decode_amiga_text(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    WINDOWS_1252
        .decode_without_bom_handling(&bytes[..end])
        .0
        .into_owned()
}

// --- BitReader ---

/// MSB-first reader over a track payload.
///
/// Keeps at least 16 bits buffered. Lookahead past the end of the payload
/// reads zeros, but consuming bits the payload does not have is an error.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buf: u32,
    bits_in_buf: u32,
    consumed: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        let mut reader = Self {
            data,
            pos: 0,
            bit_buf: 0,
            bits_in_buf: 0,
            consumed: 0,
        };
        reader.fill_buf();
        reader
    }

    fn fill_buf(&mut self) {
        while self.bits_in_buf < 16 {
            let byte = self.data.get(self.pos).copied().unwrap_or(0);
            self.pos += 1;
            self.bit_buf = (self.bit_buf << 8) | u32::from(byte);
            self.bits_in_buf += 8;
        }
    }

    fn peek(&self, n: u32) -> u16 {
        (self.bit_buf >> (self.bits_in_buf - n)) as u16
    }

    fn consume(&mut self, n: u32) -> Result<(), DecodeFault> {
        if n > 16 {
            return Err(DecodeFault::BadCode);
        }
        self.consumed += n as usize;
        if self.consumed > self.data.len() * 8 {
            return Err(DecodeFault::InputExhausted);
        }
        self.bits_in_buf -= n;
        self.bit_buf &= (1u32 << self.bits_in_buf) - 1;
        self.fill_buf();
        Ok(())
    }

    fn read(&mut self, n: u32) -> Result<u16, DecodeFault> {
        let value = self.peek(n);
        self.consume(n)?;
        Ok(value)
    }
}

// --- Run-length stage ---

const RLE_ESCAPE: u8 = 0x90;

/// Expand `input` into exactly `output.len()` bytes.
fn unpack_rle(input: &[u8], output: &mut [u8]) -> Result<(), DecodeFault> {
    let mut bytes = input.iter().copied();
    let mut next = || bytes.next().ok_or(DecodeFault::InputExhausted);
    let mut out = 0;
    while out < output.len() {
        let b = next()?;
        if b != RLE_ESCAPE {
            output[out] = b;
            out += 1;
            continue;
        }
        let count = next()?;
        if count == 0 {
            output[out] = RLE_ESCAPE;
            out += 1;
            continue;
        }
        let value = next()?;
        let run = if count == 0xFF {
            usize::from(u16::from_be_bytes([next()?, next()?]))
        } else {
            usize::from(count)
        };
        let end = out + run;
        if end > output.len() {
            return Err(DecodeFault::RunOverflow);
        }
        output[out..end].fill(value);
        out = end;
    }
    Ok(())
}

// --- Dictionary ---

/// Shared LZ dictionary. Only the low 16 KiB are ever addressed.
const DICTIONARY_LEN: usize = 0x4000;
/// Bytes cleared when the coders are reset.
const DICTIONARY_RESET_LEN: usize = 0x3FC8;

/// Output side of an LZ coder.
///
/// Every byte lands in the dictionary at the coder's cursor. Bytes past the
/// end of the track still advance the cursor but are not stored in `out`.
struct LzSink<'s> {
    out: &'s mut [u8],
    pos: usize,
    text: &'s mut [u8],
    mask: u16,
    loc: u16,
}

impl<'s> LzSink<'s> {
    fn new(out: &'s mut [u8], text: &'s mut [u8], mask: u16, loc: u16) -> Self {
        Self {
            out,
            pos: 0,
            text,
            mask,
            loc,
        }
    }

    fn is_full(&self) -> bool {
        self.pos >= self.out.len()
    }

    fn literal(&mut self, b: u8) {
        if let Some(slot) = self.out.get_mut(self.pos) {
            *slot = b;
        }
        self.pos += 1;
        self.text[usize::from(self.loc & self.mask)] = b;
        self.loc = self.loc.wrapping_add(1);
    }

    /// Copy `len` bytes starting `distance + 1` bytes behind the cursor.
    fn back_reference(&mut self, distance: u16, len: u16) {
        let mut src = self.loc.wrapping_sub(distance).wrapping_sub(1);
        for _ in 0..len {
            let b = self.text[usize::from(src & self.mask)];
            src = src.wrapping_add(1);
            self.literal(b);
        }
    }

    fn cursor(&self) -> u16 {
        self.loc
    }
}

/// Length/position tables shared by MEDIUM and DEEP: the high six bits of a
/// position and the number of extra bits that follow the first byte.
const D_CODE: [u8; 256] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01,
    0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02,
    0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03,
    0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
    0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07,
    0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x09, 0x09, 0x09, 0x09, 0x09, 0x09, 0x09, 0x09,
    0x0A, 0x0A, 0x0A, 0x0A, 0x0A, 0x0A, 0x0A, 0x0A, 0x0B, 0x0B, 0x0B, 0x0B, 0x0B, 0x0B, 0x0B, 0x0B,
    0x0C, 0x0C, 0x0C, 0x0C, 0x0D, 0x0D, 0x0D, 0x0D, 0x0E, 0x0E, 0x0E, 0x0E, 0x0F, 0x0F, 0x0F, 0x0F,
    0x10, 0x10, 0x10, 0x10, 0x11, 0x11, 0x11, 0x11, 0x12, 0x12, 0x12, 0x12, 0x13, 0x13, 0x13, 0x13,
    0x14, 0x14, 0x14, 0x14, 0x15, 0x15, 0x15, 0x15, 0x16, 0x16, 0x16, 0x16, 0x17, 0x17, 0x17, 0x17,
    0x18, 0x18, 0x19, 0x19, 0x1A, 0x1A, 0x1B, 0x1B, 0x1C, 0x1C, 0x1D, 0x1D, 0x1E, 0x1E, 0x1F, 0x1F,
    0x20, 0x20, 0x21, 0x21, 0x22, 0x22, 0x23, 0x23, 0x24, 0x24, 0x25, 0x25, 0x26, 0x26, 0x27, 0x27,
    0x28, 0x28, 0x29, 0x29, 0x2A, 0x2A, 0x2B, 0x2B, 0x2C, 0x2C, 0x2D, 0x2D, 0x2E, 0x2E, 0x2F, 0x2F,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
];

const D_LEN: [u8; 256] = [
    0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03,
    0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03, 0x03,
    0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04,
    0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04,
    0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04,
    0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
    0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
    0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
    0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
    0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06,
    0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06,
    0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06,
    0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07,
    0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07,
    0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07, 0x07,
    0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08,
];

/// Finish a table-coded position whose first byte is `first`.
fn position_tail(reader: &mut BitReader, first: u16) -> Result<u16, DecodeFault> {
    let high = u16::from(D_CODE[usize::from(first)]) << 8;
    let extra = u32::from(D_LEN[usize::from(first)]);
    let low = ((first << extra) | reader.read(extra)?) & 0xFF;
    Ok(high | low)
}

// --- QUICK ---

const QUICK_MASK: u16 = 0xFF;

struct QuickCoder {
    loc: u16,
}

impl QuickCoder {
    const INITIAL_LOC: u16 = 251;

    fn unpack(
        &mut self,
        reader: &mut BitReader,
        text: &mut [u8],
        out: &mut [u8],
    ) -> Result<(), DecodeFault> {
        let mut sink = LzSink::new(out, text, QUICK_MASK, self.loc);
        while !sink.is_full() {
            if reader.read(1)? != 0 {
                sink.literal(reader.read(8)? as u8);
            } else {
                let len = reader.read(2)? + 2;
                let distance = reader.read(8)?;
                sink.back_reference(distance, len);
            }
        }
        self.loc = sink.cursor().wrapping_add(5) & QUICK_MASK;
        Ok(())
    }
}

// --- MEDIUM ---

const MEDIUM_MASK: u16 = 0x3FFF;

struct MediumCoder {
    loc: u16,
}

impl MediumCoder {
    const INITIAL_LOC: u16 = 0x3FBE;

    fn unpack(
        &mut self,
        reader: &mut BitReader,
        text: &mut [u8],
        out: &mut [u8],
    ) -> Result<(), DecodeFault> {
        let mut sink = LzSink::new(out, text, MEDIUM_MASK, self.loc);
        while !sink.is_full() {
            if reader.read(1)? != 0 {
                sink.literal(reader.read(8)? as u8);
            } else {
                let code = reader.read(8)?;
                let len = u16::from(D_CODE[usize::from(code)]) + 3;
                let extra = u32::from(D_LEN[usize::from(code)]);
                let first = ((code << extra) | reader.read(extra)?) & 0xFF;
                let distance = position_tail(reader, first)?;
                sink.back_reference(distance, len);
            }
        }
        self.loc = sink.cursor().wrapping_add(66) & MEDIUM_MASK;
        Ok(())
    }
}

// --- DEEP ---

const DEEP_MASK: u16 = 0x3FFF;
const DEEP_LOOKAHEAD: usize = 60;
const DEEP_THRESHOLD: u16 = 2;
/// Literals plus match lengths.
const N_CHAR: usize = 256 - DEEP_THRESHOLD as usize + DEEP_LOOKAHEAD;
const TREE_SIZE: usize = N_CHAR * 2 - 1;
const ROOT: usize = TREE_SIZE - 1;
const MAX_FREQ: u16 = 0x8000;

/// Adaptive Huffman tree in the LZHUF layout.
///
/// Nodes are kept in ascending frequency order. `son[n]` is the left child
/// of `n` (the right child is `son[n] + 1`) or, for leaves, the symbol plus
/// `TREE_SIZE`. `prnt[TREE_SIZE + symbol]` locates the leaf of a symbol.
struct AdaptiveTree {
    freq: [u16; TREE_SIZE + 1],
    prnt: [u16; TREE_SIZE + N_CHAR],
    son: [u16; TREE_SIZE],
}

impl AdaptiveTree {
    fn new() -> Self {
        Self {
            freq: [0; TREE_SIZE + 1],
            prnt: [0; TREE_SIZE + N_CHAR],
            son: [0; TREE_SIZE],
        }
    }

    fn reset(&mut self) {
        for i in 0..N_CHAR {
            self.freq[i] = 1;
            self.son[i] = (i + TREE_SIZE) as u16;
            self.prnt[i + TREE_SIZE] = i as u16;
        }
        let mut i = 0;
        let mut j = N_CHAR;
        while j <= ROOT {
            self.freq[j] = self.freq[i] + self.freq[i + 1];
            self.son[j] = i as u16;
            self.prnt[i] = j as u16;
            self.prnt[i + 1] = j as u16;
            i += 2;
            j += 1;
        }
        // backstop, larger than any real frequency
        self.freq[TREE_SIZE] = 0xFFFF;
        self.prnt[ROOT] = 0;
    }

    /// Halve every leaf frequency and rebuild the tree from scratch.
    fn rebuild(&mut self) {
        let mut j = 0;
        for i in 0..TREE_SIZE {
            if usize::from(self.son[i]) >= TREE_SIZE {
                self.freq[j] = (self.freq[i] + 1) / 2;
                self.son[j] = self.son[i];
                j += 1;
            }
        }
        let mut i = 0;
        for j in N_CHAR..TREE_SIZE {
            let f = self.freq[i] + self.freq[i + 1];
            let mut k = j - 1;
            while f < self.freq[k] {
                k -= 1;
            }
            k += 1;
            self.freq.copy_within(k..j, k + 1);
            self.freq[k] = f;
            self.son.copy_within(k..j, k + 1);
            self.son[k] = i as u16;
            i += 2;
        }
        for i in 0..TREE_SIZE {
            let k = usize::from(self.son[i]);
            self.prnt[k] = i as u16;
            if k < TREE_SIZE {
                self.prnt[k + 1] = i as u16;
            }
        }
    }

    /// Count one occurrence of `symbol` and restore the frequency order.
    fn update(&mut self, symbol: u16) {
        if self.freq[ROOT] == MAX_FREQ {
            self.rebuild();
        }
        let mut c = usize::from(self.prnt[usize::from(symbol) + TREE_SIZE]);
        loop {
            self.freq[c] += 1;
            let k = self.freq[c];
            let mut l = c + 1;
            if k > self.freq[l] {
                while k > self.freq[l + 1] {
                    l += 1;
                }
                self.freq[c] = self.freq[l];
                self.freq[l] = k;

                let i = usize::from(self.son[c]);
                self.prnt[i] = l as u16;
                if i < TREE_SIZE {
                    self.prnt[i + 1] = l as u16;
                }

                let j = usize::from(self.son[l]);
                self.son[l] = i as u16;
                self.prnt[j] = c as u16;
                if j < TREE_SIZE {
                    self.prnt[j + 1] = c as u16;
                }
                self.son[c] = j as u16;
                c = l;
            }
            c = usize::from(self.prnt[c]);
            if c == 0 {
                break;
            }
        }
    }

    fn decode_symbol(&mut self, reader: &mut BitReader) -> Result<u16, DecodeFault> {
        let mut c = usize::from(self.son[ROOT]);
        while c < TREE_SIZE {
            c = usize::from(self.son[c + usize::from(reader.read(1)?)]);
        }
        let symbol = (c - TREE_SIZE) as u16;
        self.update(symbol);
        Ok(symbol)
    }
}

struct DeepCoder {
    loc: u16,
    tree: AdaptiveTree,
    needs_init: bool,
}

impl DeepCoder {
    const INITIAL_LOC: u16 = 0x3FC4;

    fn new() -> Self {
        Self {
            loc: Self::INITIAL_LOC,
            tree: AdaptiveTree::new(),
            needs_init: true,
        }
    }

    fn unpack(
        &mut self,
        reader: &mut BitReader,
        text: &mut [u8],
        out: &mut [u8],
    ) -> Result<(), DecodeFault> {
        if self.needs_init {
            self.tree.reset();
            self.needs_init = false;
        }
        let mut sink = LzSink::new(out, text, DEEP_MASK, self.loc);
        while !sink.is_full() {
            let c = self.tree.decode_symbol(reader)?;
            if c < 256 {
                sink.literal(c as u8);
            } else {
                let len = c - 255 + DEEP_THRESHOLD;
                let first = reader.read(8)?;
                let distance = position_tail(reader, first)?;
                sink.back_reference(distance, len);
            }
        }
        self.loc = sink.cursor().wrapping_add(60) & DEEP_MASK;
        Ok(())
    }
}

// --- HEAVY ---

/// Literals plus match lengths.
const HEAVY_NC: usize = 510;
/// Capacity of the distance code-length array.
const HEAVY_NPT: usize = 20;
const HEAVY_OFFSET: u16 = 253;
const SYMBOL_LOOKUP_BITS: u32 = 12;
const DISTANCE_LOOKUP_BITS: u32 = 8;
/// Deepest code the table builder accepts.
const MAX_CODE_DEPTH: u32 = 32;

/// Canonical Huffman decode table: a flat lookup for codes up to
/// `lookup_bits` long and a binary tree for the rest.
struct CodeTable {
    lengths: Vec<u8>,
    lookup: Vec<u16>,
    left: Vec<u16>,
    right: Vec<u16>,
    lookup_bits: u32,
}

impl CodeTable {
    fn new(capacity: usize, lookup_bits: u32) -> Self {
        Self {
            lengths: vec![0; capacity],
            lookup: vec![0; 1 << lookup_bits],
            left: vec![0; 2 * capacity - 1],
            right: vec![0; 2 * capacity - 1],
            lookup_bits,
        }
    }

    /// Read a transmitted table: a count, then that many code lengths.
    /// A zero count is followed by the single symbol every code maps to.
    fn read(
        &mut self,
        reader: &mut BitReader,
        count_bits: u32,
        length_bits: u32,
        symbols: usize,
    ) -> Result<(), DecodeFault> {
        let count = usize::from(reader.read(count_bits)?);
        if count == 0 {
            let symbol = reader.read(count_bits)?;
            self.fill(symbol, symbols)?;
            return Ok(());
        }
        if count > self.lengths.len() {
            return Err(DecodeFault::TableTooLarge(count));
        }
        for len in &mut self.lengths[..count] {
            *len = reader.read(length_bits)? as u8;
        }
        self.lengths[count..].fill(0);
        self.build(symbols)?;
        Ok(())
    }

    /// Make every bit pattern decode to `symbol` without consuming input.
    fn fill(&mut self, symbol: u16, symbols: usize) -> Result<(), DecodeFault> {
        if usize::from(symbol) >= symbols {
            return Err(DecodeFault::InvalidSymbol(symbol));
        }
        self.lengths.fill(0);
        self.lookup.fill(symbol);
        Ok(())
    }

    fn build(&mut self, symbols: usize) -> Result<(), TableError> {
        let table_size = 1u32 << self.lookup_bits;
        TableBuilder {
            lengths: &self.lengths[..symbols],
            lookup: &mut self.lookup,
            left: &mut self.left,
            right: &mut self.right,
            symbols: symbols as u16,
            table_size,
            max_depth: self.lookup_bits + 1,
            len: 1,
            depth: 1,
            avail: symbols as u16,
            codeword: 0,
            bit: table_size / 2,
            next: -1,
        }
        .run()
    }

    fn decode(&self, reader: &mut BitReader, symbols: usize) -> Result<u16, DecodeFault> {
        let bits = self.lookup_bits;
        let mut j = self.lookup[usize::from(reader.peek(bits))];
        if usize::from(j) < symbols {
            let len = u32::from(self.lengths[usize::from(j)]);
            if len > bits {
                return Err(DecodeFault::BadCode);
            }
            reader.consume(len)?;
            return Ok(j);
        }

        reader.consume(bits)?;
        let window = reader.peek(16);
        let mut mask = 0x8000u16;
        while usize::from(j) >= symbols {
            if mask == 0 {
                return Err(DecodeFault::BadCode);
            }
            let branch = if window & mask != 0 {
                &self.right
            } else {
                &self.left
            };
            j = *branch.get(usize::from(j)).ok_or(DecodeFault::BadCode)?;
            mask >>= 1;
        }
        let len = u32::from(self.lengths[usize::from(j)]);
        let extra = len.checked_sub(bits).ok_or(DecodeFault::BadCode)?;
        reader.consume(extra)?;
        Ok(j)
    }
}

/// Assigns consecutive code words to symbols in order of code length,
/// filling the lookup for short codes and growing tree nodes below it.
struct TableBuilder<'t> {
    lengths: &'t [u8],
    lookup: &'t mut [u16],
    left: &'t mut [u16],
    right: &'t mut [u16],
    symbols: u16,
    table_size: u32,
    max_depth: u32,
    len: u32,
    depth: u32,
    avail: u16,
    codeword: u32,
    bit: u32,
    next: i32,
}

impl TableBuilder<'_> {
    fn run(mut self) -> Result<(), TableError> {
        self.walk()?;
        self.walk()?;
        if self.codeword != self.table_size {
            return Err(TableError::Incomplete);
        }
        Ok(())
    }

    /// Resolve the subtree at the current depth, returning its symbol or node.
    fn walk(&mut self) -> Result<u16, TableError> {
        let mut node = 0u16;
        if self.len == self.depth {
            loop {
                self.next += 1;
                if self.next >= i32::from(self.symbols) {
                    break;
                }
                let symbol = self.next as usize;
                if u32::from(self.lengths[symbol]) == self.len {
                    let start = self.codeword as usize;
                    self.codeword += self.bit;
                    if self.codeword > self.table_size {
                        return Err(TableError::CodeOverflow);
                    }
                    self.lookup[start..self.codeword as usize].fill(symbol as u16);
                    return Ok(symbol as u16);
                }
            }
            self.next = -1;
            self.len += 1;
            self.bit >>= 1;
        }

        self.depth += 1;
        if self.depth < self.max_depth {
            self.walk()?;
            self.walk()?;
        } else if self.depth > MAX_CODE_DEPTH {
            return Err(TableError::DepthExceeded);
        } else {
            node = self.avail;
            self.avail += 1;
            if u32::from(node) >= 2 * u32::from(self.symbols) - 1 {
                return Err(TableError::NodeOverflow);
            }
            self.left[usize::from(node)] = self.walk()?;
            self.right[usize::from(node)] = self.walk()?;
            if self.codeword >= self.table_size {
                return Err(TableError::CodeOverflow);
            }
            if self.depth == self.max_depth {
                self.lookup[self.codeword as usize] = node;
                self.codeword += 1;
            }
        }
        self.depth -= 1;
        Ok(node)
    }
}

struct HeavyCoder {
    loc: u16,
    last_len: u16,
    symbols: CodeTable,
    distances: CodeTable,
}

impl HeavyCoder {
    fn new() -> Self {
        Self {
            loc: 0,
            last_len: 0,
            symbols: CodeTable::new(HEAVY_NC, SYMBOL_LOOKUP_BITS),
            distances: CodeTable::new(HEAVY_NPT, DISTANCE_LOOKUP_BITS),
        }
    }

    fn unpack(
        &mut self,
        reader: &mut BitReader,
        text: &mut [u8],
        out: &mut [u8],
        flags: u8,
    ) -> Result<(), DecodeFault> {
        let (np, mask) = if flags & track_flags::LARGE_WINDOW != 0 {
            (15, 0x1FFF)
        } else {
            (14, 0x0FFF)
        };
        if flags & track_flags::NEW_TABLES != 0 {
            self.symbols.read(reader, 9, 5, HEAVY_NC)?;
            self.distances.read(reader, 5, 4, np)?;
        }

        let mut sink = LzSink::new(out, text, mask, self.loc);
        while !sink.is_full() {
            let c = self.symbols.decode(reader, HEAVY_NC)?;
            if c < 256 {
                sink.literal(c as u8);
            } else {
                let distance = self.decode_distance(reader, np)?;
                sink.back_reference(distance, c - HEAVY_OFFSET);
            }
        }
        self.loc = sink.cursor();
        Ok(())
    }

    /// The last distance symbol repeats the previous distance.
    fn decode_distance(&mut self, reader: &mut BitReader, np: usize) -> Result<u16, DecodeFault> {
        let j = self.distances.decode(reader, np)?;
        if usize::from(j) != np - 1 {
            self.last_len = if j > 0 {
                let extra = u32::from(j - 1);
                reader.read(extra)? | (1 << extra)
            } else {
                0
            };
        }
        Ok(self.last_len)
    }
}

// --- Decryption ---

/// Running XOR cipher keyed by the CRC-16 of the password.
struct Cipher {
    key: u16,
}

impl Cipher {
    fn new(passphrase: &[u8]) -> Self {
        Self {
            key: crc16(passphrase),
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        for b in data {
            let t = *b;
            *b ^= self.key as u8;
            self.key = (self.key >> 1).wrapping_add(u16::from(t));
        }
    }
}

// --- Session ---

/// All mutable state of one decode: track buffers, the shared dictionary
/// and every coder's persistent state.
struct Session {
    packed: Box<[u8]>,
    unpacked: Box<[u8]>,
    dictionary: Box<[u8]>,
    quick: QuickCoder,
    medium: MediumCoder,
    deep: DeepCoder,
    heavy: HeavyCoder,
}

impl Session {
    fn new() -> Self {
        Self {
            packed: vec![0; TRACK_BUFFER_LEN].into_boxed_slice(),
            unpacked: vec![0; TRACK_BUFFER_LEN].into_boxed_slice(),
            dictionary: vec![0; DICTIONARY_LEN].into_boxed_slice(),
            quick: QuickCoder {
                loc: QuickCoder::INITIAL_LOC,
            },
            medium: MediumCoder {
                loc: MediumCoder::INITIAL_LOC,
            },
            deep: DeepCoder::new(),
            heavy: HeavyCoder::new(),
        }
    }

    fn reset_coders(&mut self) {
        self.quick.loc = QuickCoder::INITIAL_LOC;
        self.medium.loc = MediumCoder::INITIAL_LOC;
        self.heavy.last_len = 0;
        self.heavy.loc = 0;
        self.deep.loc = DeepCoder::INITIAL_LOC;
        self.deep.needs_init = true;
        self.dictionary[..DICTIONARY_RESET_LEN].fill(0);
    }

    /// Copy a track payload into the packed buffer.
    fn load(&mut self, payload: &[u8]) -> &mut [u8] {
        let packed = &mut self.packed[..payload.len()];
        packed.copy_from_slice(payload);
        packed
    }

    /// Decode the loaded payload into `track_output(header.unpacked_len)`.
    fn unpack_track(&mut self, header: &TrackHeader) -> Result<(), DmsError> {
        let packed_len = usize::from(header.packed_len);
        let stage_len = usize::from(header.stage_len);
        let unpacked_len = usize::from(header.unpacked_len);
        let mode = CompressionMode::from_code(u16::from(header.mode))
            .ok_or(DmsError::UnknownCompressionMode(header.mode))?;

        self.unpacked[..unpacked_len].fill(0);
        let input = &self.packed[..packed_len];
        let mut reader = BitReader::new(input);
        match mode {
            CompressionMode::NoComp => {
                let src = input
                    .get(..unpacked_len)
                    .ok_or(DecodeFault::InputExhausted)?;
                self.unpacked[..unpacked_len].copy_from_slice(src);
            }
            CompressionMode::Simple => {
                unpack_rle(input, &mut self.unpacked[..unpacked_len])?;
            }
            CompressionMode::Quick => {
                self.quick.unpack(
                    &mut reader,
                    &mut self.dictionary,
                    &mut self.unpacked[..stage_len],
                )?;
                self.run_length_stage(stage_len, unpacked_len)?;
            }
            CompressionMode::Medium => {
                self.medium.unpack(
                    &mut reader,
                    &mut self.dictionary,
                    &mut self.unpacked[..stage_len],
                )?;
                self.run_length_stage(stage_len, unpacked_len)?;
            }
            CompressionMode::Deep => {
                self.deep.unpack(
                    &mut reader,
                    &mut self.dictionary,
                    &mut self.unpacked[..stage_len],
                )?;
                self.run_length_stage(stage_len, unpacked_len)?;
            }
            CompressionMode::Heavy1 | CompressionMode::Heavy2 => {
                let flags = if mode == CompressionMode::Heavy2 {
                    header.flags | track_flags::LARGE_WINDOW
                } else {
                    header.flags & 0x07
                };
                self.heavy.unpack(
                    &mut reader,
                    &mut self.dictionary,
                    &mut self.unpacked[..stage_len],
                    flags,
                )?;
                if header.flags & track_flags::RLE_STAGE != 0 {
                    self.run_length_stage(stage_len, unpacked_len)?;
                }
            }
        }

        if header.flags & track_flags::KEEP_STATE == 0 {
            self.reset_coders();
        }
        Ok(())
    }

    fn run_length_stage(
        &mut self,
        stage_len: usize,
        unpacked_len: usize,
    ) -> Result<(), DecodeFault> {
        unpack_rle(&self.unpacked[..stage_len], &mut self.packed[..unpacked_len])?;
        self.unpacked[..unpacked_len].copy_from_slice(&self.packed[..unpacked_len]);
        Ok(())
    }

    fn track_output(&self, len: u16) -> &[u8] {
        &self.unpacked[..usize::from(len)]
    }
}

// --- Archive ---

/// Options for [`decompress`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions<'a> {
    /// Password for encrypted archives. An empty password counts as none.
    pub passphrase: Option<&'a [u8]>,
    /// Skip damaged tracks instead of failing.
    pub tolerant: bool,
}

impl<'a> UnpackOptions<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn passphrase(mut self, passphrase: &'a [u8]) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    #[must_use]
    pub fn tolerant(mut self, tolerant: bool) -> Self {
        self.tolerant = tolerant;
        self
    }
}

/// Result of a successful [`decompress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub header: HeaderInfo,
    /// Bytes written to the output buffer.
    pub written: usize,
    pub side_channels: SideChannels,
    /// Decoding stopped at the record bound while more track records
    /// followed.
    pub truncated: bool,
}

/// A failed [`decompress`], with whatever was recovered before the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} after {written} bytes")]
pub struct UnpackError {
    #[source]
    pub kind: DmsError,
    /// Bytes written to the output buffer before the failure.
    pub written: usize,
    pub side_channels: SideChannels,
}

impl UnpackError {
    fn before_tracks(kind: DmsError) -> Self {
        Self {
            kind,
            written: 0,
            side_channels: SideChannels::default(),
        }
    }
}

/// A decoded disk image with its header and text tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub data: Vec<u8>,
    pub header: HeaderInfo,
    pub side_channels: SideChannels,
    /// See [`Unpacked::truncated`].
    pub truncated: bool,
}

enum Step {
    Continue,
    Done,
}

struct Unpacker<'a, 'o> {
    data: &'a [u8],
    pos: usize,
    output: &'o mut [u8],
    written: usize,
    tolerant: bool,
    cipher: Option<Cipher>,
    session: Session,
    side_channels: SideChannels,
}

impl Unpacker<'_, '_> {
    /// Walk the track records. Returns true if the record bound cut the
    /// archive short.
    fn run<F: FnMut(&TrackReport)>(
        &mut self,
        limit: usize,
        on_track: &mut F,
    ) -> Result<bool, DmsError> {
        for _ in 0..limit {
            if let Step::Done = self.step(on_track)? {
                return Ok(false);
            }
        }
        if !self.at_record() {
            return Ok(false);
        }
        warn!(
            "Stopping after {} track records at offset 0x{:X}",
            limit, self.pos
        );
        Ok(true)
    }

    fn at_record(&self) -> bool {
        self.data.get(self.pos..).map_or(false, |rest| {
            rest.len() >= TRACK_HEADER_LEN && &rest[..2] == TRACK_MAGIC
        })
    }

    fn step<F: FnMut(&TrackReport)>(&mut self, on_track: &mut F) -> Result<Step, DmsError> {
        let start = self.pos;
        let remaining = self.data.get(start..).unwrap_or_default();
        if remaining.len() < TRACK_HEADER_LEN {
            if !remaining.is_empty() {
                debug!("Ignoring {} trailing bytes at 0x{:X}", remaining.len(), start);
            }
            return Ok(Step::Done);
        }
        let raw = &remaining[..TRACK_HEADER_LEN];
        if &raw[..2] != TRACK_MAGIC {
            debug!("No track marker at 0x{:X}, treating as end of archive", start);
            return Ok(Step::Done);
        }
        self.pos += TRACK_HEADER_LEN;

        let header = TrackHeader::parse(raw);
        if crc16(&raw[..TRACK_HEADER_LEN - 2]) != header.header_crc {
            if self.tolerant {
                warn!("Track header CRC mismatch at 0x{:X}, skipping", start);
                return Ok(Step::Continue);
            }
            return Err(DmsError::TrackHeaderCrcMismatch);
        }

        let packed_len = usize::from(header.packed_len);
        if !header.fits_track_buffer() {
            if self.tolerant {
                warn!("Track {} is too large, skipping", header.number);
                self.pos += packed_len;
                return Ok(Step::Continue);
            }
            return Err(DmsError::TrackTooLarge);
        }

        let payload = match self.data.get(self.pos..self.pos + packed_len) {
            Some(payload) => payload,
            None => {
                if self.tolerant {
                    warn!("Track {} is truncated", header.number);
                    self.pos = self.data.len();
                    return Ok(Step::Continue);
                }
                return Err(DmsError::TruncatedInput);
            }
        };
        self.pos += packed_len;

        let crc_ok = crc16(payload) == header.data_crc;
        if !crc_ok {
            if !self.tolerant {
                return Err(DmsError::TrackPayloadCrcMismatch);
            }
            warn!("Track {} data CRC mismatch", header.number);
        }

        let packed = self.session.load(payload);
        if header.number != FILEID_TRACK {
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.decrypt(packed);
            }
        }

        debug!(
            "Track {}: {} packed={} stage={} unpacked={} flags=0x{:02X}",
            header.number,
            header.mode_name(),
            header.packed_len,
            header.stage_len,
            header.unpacked_len,
            header.flags
        );

        match header.number {
            BANNER_TRACK => self.capture_side_channel(&header, true),
            FILEID_TRACK => self.capture_side_channel(&header, false),
            0 if header.unpacked_len <= DECOY_LEN => {
                debug!("Skipping fake boot block on track 0");
            }
            n if n < DATA_TRACKS && header.unpacked_len > DECOY_LEN => {
                self.data_track(&header, crc_ok, on_track)?;
            }
            n => debug!("Ignoring track {}", n),
        }
        Ok(Step::Continue)
    }

    /// Decode a text track. The first good copy of each kind is kept.
    fn capture_side_channel(&mut self, header: &TrackHeader, banner: bool) {
        if let Err(e) = self.session.unpack_track(header) {
            debug!("Text track {} did not decode: {}", header.number, e);
            return;
        }
        let slot = if banner {
            &mut self.side_channels.banner
        } else {
            &mut self.side_channels.file_id
        };
        if slot.is_none() {
            *slot = Some(self.session.track_output(header.unpacked_len).to_vec());
        }
    }

    fn data_track<F: FnMut(&TrackReport)>(
        &mut self,
        header: &TrackHeader,
        crc_ok: bool,
        on_track: &mut F,
    ) -> Result<(), DmsError> {
        let encrypted = self.cipher.is_some();
        let (decoded, checksum_ok) = match self.session.unpack_track(header) {
            Ok(()) => {
                let output = self.session.track_output(header.unpacked_len);
                let ok = checksum(output) == header.checksum;
                if !ok {
                    if !self.tolerant {
                        return Err(if encrypted {
                            DmsError::WrongPassphrase
                        } else {
                            DmsError::ChecksumMismatch
                        });
                    }
                    warn!("Track {} checksum mismatch", header.number);
                }
                (true, ok)
            }
            Err(e) => {
                if !self.tolerant {
                    return Err(if encrypted { DmsError::WrongPassphrase } else { e });
                }
                warn!("Track {} failed to decode: {}", header.number, e);
                (false, false)
            }
        };

        on_track(&TrackReport {
            header: *header,
            crc_ok,
            decoded,
            checksum_ok,
        });

        let len = usize::from(header.unpacked_len);
        let end = self.written + len;
        if end > self.output.len() {
            if !self.tolerant {
                return Err(DmsError::OutputBufferFull);
            }
            warn!("Output full, dropping track {}", header.number);
            return Ok(());
        }
        self.output[self.written..end]
            .copy_from_slice(self.session.track_output(header.unpacked_len));
        self.written = end;
        Ok(())
    }
}

/// Decode a DMS archive into `output`.
///
/// The length of `output` is the capacity; it is never written past.
pub fn decompress(
    data: &[u8],
    output: &mut [u8],
    options: &UnpackOptions<'_>,
) -> Result<Unpacked, UnpackError> {
    decompress_with(data, output, options, |_| {})
}

/// Decode a DMS archive into `output`, reporting every data track to
/// `on_track` before it is written.
pub fn decompress_with<F>(
    data: &[u8],
    output: &mut [u8],
    options: &UnpackOptions<'_>,
    mut on_track: F,
) -> Result<Unpacked, UnpackError>
where
    F: FnMut(&TrackReport),
{
    let header = read_header_info(data).map_err(UnpackError::before_tracks)?;
    if header.disk_type == DISK_TYPE_FMS {
        return Err(UnpackError::before_tracks(DmsError::UnsupportedArchiveKind));
    }
    let cipher = if header.is_encrypted() {
        match options.passphrase.filter(|p| !p.is_empty()) {
            Some(passphrase) => Some(Cipher::new(passphrase)),
            None => {
                return Err(UnpackError::before_tracks(
                    DmsError::NoPassphraseForEncrypted,
                ))
            }
        }
    } else {
        None
    };

    let mut unpacker = Unpacker {
        data,
        pos: HEADER_LEN,
        output,
        written: 0,
        tolerant: options.tolerant,
        cipher,
        session: Session::new(),
        side_channels: SideChannels::default(),
    };
    let outcome = unpacker.run(header.record_limit(), &mut on_track);
    let Unpacker {
        written,
        side_channels,
        ..
    } = unpacker;

    match outcome {
        Ok(truncated) => Ok(Unpacked {
            header,
            written,
            side_channels,
            truncated,
        }),
        Err(kind) => Err(UnpackError {
            kind,
            written,
            side_channels,
        }),
    }
}

/// Decode a DMS archive into a freshly allocated image.
pub fn decompress_to_vec(
    data: &[u8],
    options: &UnpackOptions<'_>,
) -> Result<DiskImage, UnpackError> {
    let header = read_header_info(data).map_err(UnpackError::before_tracks)?;
    let mut image = vec![0u8; header.image_capacity()];
    let unpacked = decompress(data, &mut image, options)?;
    image.truncate(unpacked.written);
    Ok(DiskImage {
        data: image,
        header: unpacked.header,
        side_channels: unpacked.side_channels,
        truncated: unpacked.truncated,
    })
}
