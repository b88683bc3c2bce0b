use dms::{info, DmsError, TrackReport, UnpackOptions, BANNER_TRACK, FILEID_TRACK};
use proptest::prelude::*;

const TRACK_LEN: usize = 11264;

// Helper to calculate CRC16
fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |s, &b| s.wrapping_add(b as u16))
}

fn header(lo: u16, hi: u16, unpacked: u32, disk_type: u16, mode: u16, geninfo: u16) -> Vec<u8> {
    let mut h = vec![0u8; 56];
    h[0..4].copy_from_slice(b"DMS!");
    h[10..12].copy_from_slice(&geninfo.to_be_bytes());
    h[16..18].copy_from_slice(&lo.to_be_bytes());
    h[18..20].copy_from_slice(&hi.to_be_bytes());
    h[25..28].copy_from_slice(&unpacked.to_be_bytes()[1..]);
    h[46..48].copy_from_slice(&111u16.to_be_bytes());
    h[50..52].copy_from_slice(&disk_type.to_be_bytes());
    h[52..54].copy_from_slice(&mode.to_be_bytes());
    let crc = crc16(&h[4..54]);
    h[54..56].copy_from_slice(&crc.to_be_bytes());
    h
}

fn track(
    number: u16,
    mode: u8,
    flags: u8,
    payload: &[u8],
    stage_len: usize,
    unpacked: &[u8],
) -> Vec<u8> {
    let mut t = vec![0u8; 20];
    t[0..2].copy_from_slice(b"TR");
    t[2..4].copy_from_slice(&number.to_be_bytes());
    t[6..8].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    t[8..10].copy_from_slice(&(stage_len as u16).to_be_bytes());
    t[10..12].copy_from_slice(&(unpacked.len() as u16).to_be_bytes());
    t[12] = flags;
    t[13] = mode;
    t[14..16].copy_from_slice(&checksum(unpacked).to_be_bytes());
    t[16..18].copy_from_slice(&crc16(payload).to_be_bytes());
    let crc = crc16(&t[0..18]);
    t[18..20].copy_from_slice(&crc.to_be_bytes());
    t.extend_from_slice(payload);
    t
}

fn nocomp_track(number: u16, data: &[u8]) -> Vec<u8> {
    track(number, 0, 0, data, data.len(), data)
}

fn track_data(number: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((number * 37 + i) & 0xFF) as u8).collect()
}

fn archive(lo: u16, hi: u16, geninfo: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
    let mut data = header(lo, hi, 0, 2, 0, geninfo);
    for t in tracks {
        data.extend_from_slice(t);
    }
    data
}

/// MSB-first bit writer for coder payloads.
struct BitWriter {
    data: Vec<u8>,
    acc: u32,
    n: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self { data: Vec::new(), acc: 0, n: 0 }
    }

    fn write(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            self.acc = (self.acc << 1) | ((value >> i) & 1);
            self.n += 1;
            if self.n == 8 {
                self.data.push(self.acc as u8);
                self.acc = 0;
                self.n = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.n > 0 {
            self.data.push((self.acc << (8 - self.n)) as u8);
        }
        self.data
    }
}

#[test]
fn test_detect() {
    let valid = header(0, 79, 901120, 0, 5, 0);
    assert!(dms::detect(&valid));
    assert!(!dms::detect(&valid[..55]));

    let mut bad_magic = valid.clone();
    bad_magic[0] = b'X';
    assert!(!dms::detect(&bad_magic));

    let mut bad_crc = valid.clone();
    bad_crc[20] ^= 0xFF;
    assert!(!dms::detect(&bad_crc));
}

#[test]
fn test_read_header_info() {
    let data = header(0, 79, 901120, 2, 5, info::BANNER | info::FILEID_DIZ);
    let h = dms::read_header_info(&data).expect("Should parse");
    assert_eq!(h.track_lo, 0);
    assert_eq!(h.track_hi, 79);
    assert_eq!(h.unpacked_size, 901120);
    assert_eq!(h.creator_version, 111);
    assert_eq!(h.disk_type_name(), "AmigaOS 2.0+ FFS");
    assert_eq!(h.compression_mode_name(), "HEAVY1");
    assert!(h.has_banner());
    assert!(h.has_file_id());
    assert!(!h.is_encrypted());
    assert!(!h.is_high_density());
    assert_eq!(h.flag_names(), vec!["BANNER", "FILEID.DIZ"]);
    assert_eq!(h.declared_tracks(), 80);

    let data = header(0, 79, 1802240, 2, 5, info::HIGH_DENSITY);
    let h = dms::read_header_info(&data).expect("Should parse");
    assert!(h.is_high_density());
    assert_eq!(h.flag_names(), vec!["HIGHDENSITY"]);
}

#[test]
fn test_read_header_info_errors() {
    assert_eq!(dms::read_header_info(&[0u8; 10]), Err(DmsError::TruncatedInput));
    assert_eq!(dms::read_header_info(&[0u8; 56]), Err(DmsError::NotAnArchive));
    let mut data = header(0, 0, 0, 0, 0, 0);
    data[54] ^= 1;
    assert_eq!(dms::read_header_info(&data), Err(DmsError::HeaderCrcMismatch));
}

#[test]
fn test_single_nocomp_track() {
    let payload = track_data(0, TRACK_LEN);
    let data = archive(0, 0, 0, &[nocomp_track(0, &payload)]);

    let mut output = vec![0u8; TRACK_LEN];
    let unpacked =
        dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(unpacked.written, TRACK_LEN);
    assert_eq!(output, payload);
    assert!(unpacked.side_channels.is_empty());
    assert!(!unpacked.truncated);
}

#[test]
fn test_tracks_land_contiguously() {
    let parts = [track_data(0, 4096), track_data(1, 5000), track_data(2, 6000)];
    let tracks: Vec<Vec<u8>> = parts
        .iter()
        .enumerate()
        .map(|(i, p)| nocomp_track(i as u16, p))
        .collect();
    let data = archive(0, 2, 0, &tracks);

    let mut output = vec![0u8; 20000];
    let unpacked =
        dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(unpacked.written, 15096);
    assert_eq!(&output[..4096], &parts[0][..]);
    assert_eq!(&output[4096..9096], &parts[1][..]);
    assert_eq!(&output[9096..15096], &parts[2][..]);
    assert!(output[15096..].iter().all(|&b| b == 0));
}

#[test]
fn test_full_disk() {
    let tracks: Vec<Vec<u8>> = (0..80)
        .map(|t| nocomp_track(t as u16, &track_data(t, TRACK_LEN)))
        .collect();
    let data = archive(0, 79, 0, &tracks);

    let image = dms::decompress_to_vec(&data, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(image.data.len(), 80 * TRACK_LEN);
    for t in [0usize, 1, 40, 79] {
        assert_eq!(&image.data[t * TRACK_LEN..(t + 1) * TRACK_LEN], &track_data(t, TRACK_LEN)[..]);
    }
}

#[test]
fn test_track_callback() {
    let tracks: Vec<Vec<u8>> = (0..3)
        .map(|t| nocomp_track(t as u16, &track_data(t, 4096)))
        .collect();
    let data = archive(0, 2, 0, &tracks);

    let mut reports: Vec<TrackReport> = Vec::new();
    let mut output = vec![0u8; 3 * 4096];
    dms::decompress_with(&data, &mut output, &UnpackOptions::new(), |r| {
        reports.push(*r)
    })
    .expect("Should decode");

    assert_eq!(reports.len(), 3);
    for (i, r) in reports.iter().enumerate() {
        assert_eq!(r.header.number, i as u16);
        assert_eq!(r.header.unpacked_len, 4096);
        assert_eq!(r.header.mode_name(), "NOCOMP");
        assert!(r.crc_ok && r.decoded && r.checksum_ok);
    }
}

#[test]
fn test_banner_and_file_id() {
    let banner = b"Packed by the Amiga preservation crew\0";
    let diz = b"Awesome Amiga Demo v1.0";
    let payload = track_data(0, TRACK_LEN);
    let data = archive(
        0,
        0,
        info::BANNER | info::FILEID_DIZ,
        &[
            nocomp_track(BANNER_TRACK, banner),
            nocomp_track(FILEID_TRACK, diz),
            nocomp_track(0, &payload),
        ],
    );

    let mut output = vec![0u8; TRACK_LEN];
    let unpacked =
        dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(unpacked.written, TRACK_LEN);
    assert_eq!(output, payload);

    let mut channels = unpacked.side_channels;
    assert_eq!(channels.banner.as_deref(), Some(&banner[..]));
    assert_eq!(channels.file_id.as_deref(), Some(&diz[..]));
    assert_eq!(
        channels.banner_text().as_deref(),
        Some("Packed by the Amiga preservation crew")
    );
    assert_eq!(channels.file_id_text().as_deref(), Some("Awesome Amiga Demo v1.0"));

    channels.release();
    channels.release();
    assert!(channels.banner.is_none());
    assert!(channels.file_id.is_none());
}

#[test]
fn test_first_banner_wins() {
    let payload = track_data(0, 4096);
    let data = archive(
        0,
        0,
        info::BANNER,
        &[
            nocomp_track(BANNER_TRACK, b"first"),
            nocomp_track(BANNER_TRACK, b"second"),
            nocomp_track(0, &payload),
        ],
    );
    let mut output = vec![0u8; 4096];
    let unpacked =
        dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(unpacked.side_channels.banner.as_deref(), Some(&b"first"[..]));
}

#[test]
fn test_fake_boot_block_is_skipped() {
    let decoy = vec![0xAAu8; 1024];
    let payload = track_data(0, TRACK_LEN);
    let data = archive(0, 0, 0, &[nocomp_track(0, &decoy), nocomp_track(0, &payload)]);

    let mut reports = 0;
    let mut output = vec![0u8; TRACK_LEN];
    let unpacked = dms::decompress_with(&data, &mut output, &UnpackOptions::new(), |_| reports += 1)
        .expect("Should decode");
    assert_eq!(reports, 1);
    assert_eq!(unpacked.written, TRACK_LEN);
    assert_eq!(output, payload);
}

#[test]
fn test_out_of_range_tracks_are_ignored() {
    let data = archive(
        0,
        1,
        0,
        &[
            nocomp_track(0, &track_data(0, 4096)),
            nocomp_track(81, &track_data(81, 4096)),
            nocomp_track(1, &track_data(1, 1000)),
            nocomp_track(1, &track_data(1, 4096)),
        ],
    );
    let image = dms::decompress_to_vec(&data, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(image.data.len(), 8192);
    assert_eq!(&image.data[4096..], &track_data(1, 4096)[..]);
}

#[test]
fn test_simple_rle_long_run() {
    let payload = [0x90, 0xFF, 0x42, 0x10, 0x00];
    let expected = vec![0x42u8; 4096];
    let data = archive(0, 0, 0, &[track(0, 1, 0, &payload, payload.len(), &expected)]);

    let mut output = vec![0u8; 4096];
    let unpacked =
        dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(unpacked.written, 4096);
    assert_eq!(output, expected);
}

#[test]
fn test_simple_rle_escape() {
    let payload = [0x90, 0xFF, 0x41, 0x0F, 0xFD, 0x90, 0x00, 0x43, 0x44];
    let mut expected = vec![0x41u8; 4093];
    expected.extend_from_slice(&[0x90, 0x43, 0x44]);
    let data = archive(0, 0, 0, &[track(0, 1, 0, &payload, payload.len(), &expected)]);

    let mut output = vec![0u8; 4096];
    dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(output, expected);
}

#[test]
fn test_quick_track() {
    // "AMIG" as literals, then 5-byte matches four bytes back
    let len = 3000;
    let expected: Vec<u8> = b"AMIG".iter().copied().cycle().take(len).collect();
    let mut w = BitWriter::new();
    for &b in b"AMIG" {
        w.write(1, 1);
        w.write(b as u32, 8);
    }
    let mut produced = 4;
    while produced < len {
        w.write(0, 1);
        w.write(3, 2);
        w.write(3, 8);
        produced += 5;
    }
    let payload = w.finish();
    let data = archive(0, 0, 0, &[track(0, 2, 0, &payload, len, &expected)]);

    let image = dms::decompress_to_vec(&data, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(image.data, expected);
}

#[test]
fn test_trailing_garbage_ends_archive() {
    let payload = track_data(0, 4096);
    let mut data = archive(0, 0, 0, &[nocomp_track(0, &payload)]);
    data.extend_from_slice(b"this is not a track header at all");

    let mut output = vec![0u8; 4096];
    let unpacked =
        dms::decompress(&data, &mut output, &UnpackOptions::new()).expect("Should decode");
    assert_eq!(unpacked.written, 4096);
}

#[test]
fn test_encrypted_archive() {
    let password = b"amiga";
    let plain = [track_data(0, 4096), track_data(1, 4096)];
    let diz = b"Cracked and packed";

    let mut key = crc16(password);
    let first = encrypt(&plain[0], &mut key);
    let second = encrypt(&plain[1], &mut key);
    let data = archive(
        0,
        1,
        info::ENCRYPTED | info::FILEID_DIZ,
        &[
            track(0, 0, 0, &first, first.len(), &plain[0]),
            // FILEID.DIZ is stored in the clear and does not advance the key
            nocomp_track(FILEID_TRACK, diz),
            track(1, 0, 0, &second, second.len(), &plain[1]),
        ],
    );

    let options = UnpackOptions::new().passphrase(password);
    let image = dms::decompress_to_vec(&data, &options).expect("Should decode");
    assert_eq!(&image.data[..4096], &plain[0][..]);
    assert_eq!(&image.data[4096..], &plain[1][..]);
    assert_eq!(image.side_channels.file_id.as_deref(), Some(&diz[..]));
}

fn encrypt(plain: &[u8], key: &mut u16) -> Vec<u8> {
    plain
        .iter()
        .map(|&p| {
            let c = p ^ *key as u8;
            *key = (*key >> 1).wrapping_add(c as u16);
            c
        })
        .collect()
}

#[test]
fn test_encrypted_banner() {
    let password = b"amiga";
    let plain = [track_data(0, 4096), track_data(1, 4096)];
    let banner = b"Packed by the Amiga crew";

    let mut key = crc16(password);
    let first = encrypt(&plain[0], &mut key);
    let after_first = key;
    let sealed_banner = encrypt(banner, &mut key);
    let second = encrypt(&plain[1], &mut key);
    let tracks = [
        track(0, 0, 0, &first, first.len(), &plain[0]),
        track(BANNER_TRACK, 0, 0, &sealed_banner, banner.len(), banner),
        track(1, 0, 0, &second, second.len(), &plain[1]),
    ];
    let data = archive(0, 1, info::ENCRYPTED | info::BANNER, &tracks);

    let options = UnpackOptions::new().passphrase(password);
    let image = dms::decompress_to_vec(&data, &options).expect("Should decode");
    assert_eq!(
        image.side_channels.banner_text().as_deref(),
        Some("Packed by the Amiga crew")
    );
    assert_eq!(&image.data[..4096], &plain[0][..]);
    assert_eq!(&image.data[4096..], &plain[1][..]);

    // a key that skips the banner no longer decrypts the next track
    let mut key = after_first;
    let second = encrypt(&plain[1], &mut key);
    let tracks = [
        tracks[0].clone(),
        tracks[1].clone(),
        track(1, 0, 0, &second, second.len(), &plain[1]),
    ];
    let data = archive(0, 1, info::ENCRYPTED | info::BANNER, &tracks);
    let err = dms::decompress_to_vec(&data, &options).unwrap_err();
    assert_eq!(err.kind, DmsError::WrongPassphrase);
    assert_eq!(err.written, 4096);
    assert_eq!(err.side_channels.banner.as_deref(), Some(&banner[..]));
}

#[test]
fn test_parallel_decodes() {
    let archives: Vec<Vec<u8>> = (0..4)
        .map(|n| {
            let tracks: Vec<Vec<u8>> = (0..3)
                .map(|t| nocomp_track(t as u16, &track_data(n * 3 + t, 4096)))
                .collect();
            archive(0, 2, 0, &tracks)
        })
        .collect();

    let images: Vec<Vec<u8>> = std::thread::scope(|s| {
        let handles: Vec<_> = archives
            .iter()
            .map(|a| {
                s.spawn(move || {
                    dms::decompress_to_vec(a, &UnpackOptions::new())
                        .expect("Should decode")
                        .data
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("thread")).collect()
    });

    for (n, image) in images.iter().enumerate() {
        assert_eq!(&image[..4096], &track_data(n * 3, 4096)[..]);
    }
}

proptest! {
    #[test]
    fn prop_decode_is_deterministic(
        seed in any::<u8>(),
        count in 1usize..4,
        len in 2049usize..6000,
    ) {
        let tracks: Vec<Vec<u8>> = (0..count)
            .map(|t| nocomp_track(t as u16, &track_data(t + seed as usize, len)))
            .collect();
        let data = archive(0, count as u16 - 1, 0, &tracks);

        let first = dms::decompress_to_vec(&data, &UnpackOptions::new()).expect("Should decode");
        let second = dms::decompress_to_vec(&data, &UnpackOptions::new()).expect("Should decode");
        prop_assert_eq!(first.data.len(), count * len);
        prop_assert_eq!(first, second);
    }
}
