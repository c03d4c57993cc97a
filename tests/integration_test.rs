use std::fs::{self, File};
use std::io::Cursor;

use lzrescue::block::MemberList;
use lzrescue::fec::{self, FecCount, FecCreateParams};
use lzrescue::header::{Header, Trailer};
use lzrescue::index::{FileIndex, IndexOptions};
use lzrescue::merge;
use lzrescue::repair;
use lzrescue::surgery;

/// A syntactically valid member whose LZMA stream is undecodable filler:
/// correct header, consistent trailer, right sizes, no zero bytes in the
/// stream.
fn fake_member(stream_size: usize) -> Vec<u8> {
    let mut image = Header::new(1 << 12).unwrap().data.to_vec();
    for i in 0..stream_size {
        image.push((((i * 7) + 13) % 255) as u8 + 1);
    }
    let msize = (Header::SIZE + stream_size + Trailer::SIZE) as u64;
    image.extend_from_slice(&Trailer::new(0xDEADBEEF, 1000, msize).data);
    image
}

fn three_member_file() -> (Vec<u8>, [Vec<u8>; 3]) {
    let members = [fake_member(40), fake_member(60), fake_member(80)];
    let mut file = Vec::new();
    for m in &members {
        file.extend_from_slice(m);
    }
    (file, members)
}

fn pseudo_random(len: usize, mut state: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        v.push(state as u8);
    }
    v
}

// ── Index over real files ─────────────────────────────────────────────────────

#[test]
fn index_of_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let (file, members) = three_member_file();
    fs::write(&path, &file).unwrap();

    let mut f = File::open(&path).unwrap();
    let index = FileIndex::new(&mut f, IndexOptions::default()).unwrap();
    assert_eq!(index.len(), 3);
    assert_eq!(index.member(0).mblock.size(), members[0].len() as u64);
    assert_eq!(index.cdata_size(), file.len() as u64);
    assert_eq!(index.udata_size(), 3000);
}

// ── Dump / strip / remove / split ─────────────────────────────────────────────

#[test]
fn dump_one_member_is_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let out = dir.path().join("dumped");
    let (file, members) = three_member_file();
    fs::write(&path, &file).unwrap();

    let ml = MemberList::parse("2").unwrap();
    surgery::dump_members(&[path.as_path()], Some(&out), &ml, false, false, false, false, false, false)
        .unwrap();
    assert_eq!(fs::read(&out).unwrap(), members[1]);
}

#[test]
fn dump_and_strip_are_complementary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let (file, members) = three_member_file();
    fs::write(&path, &file).unwrap();

    let ml = MemberList::parse("2").unwrap();
    let dumped = dir.path().join("dumped");
    let stripped = dir.path().join("stripped");
    surgery::dump_members(&[path.as_path()], Some(&dumped), &ml, false, false, false, false, false, false)
        .unwrap();
    surgery::dump_members(&[path.as_path()], Some(&stripped), &ml, false, false, false, false, true, false)
        .unwrap();

    let dumped = fs::read(&dumped).unwrap();
    let stripped = fs::read(&stripped).unwrap();
    assert_eq!(dumped.len() + stripped.len(), file.len());
    let mut expected_stripped = members[0].clone();
    expected_stripped.extend_from_slice(&members[2]);
    assert_eq!(stripped, expected_stripped);
}

#[test]
fn dump_trailing_data_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let (mut file, _) = three_member_file();
    file.extend_from_slice(b"some metadata here");
    fs::write(&path, &file).unwrap();

    let ml = MemberList::parse("tdata").unwrap();
    let out = dir.path().join("tdata");
    surgery::dump_members(&[path.as_path()], Some(&out), &ml, false, false, false, false, false, false)
        .unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"some metadata here");
}

#[test]
fn remove_member_in_place_restores_times() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let (file, members) = three_member_file();
    fs::write(&path, &file).unwrap();
    let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

    let ml = MemberList::parse("2").unwrap();
    surgery::remove_members(&[path.as_path()], &ml, false, false, false, false).unwrap();

    let mut expected = members[0].clone();
    expected.extend_from_slice(&members[2]);
    assert_eq!(fs::read(&path).unwrap(), expected);

    let mut f = File::open(&path).unwrap();
    let index = FileIndex::new(&mut f, IndexOptions::default()).unwrap();
    assert_eq!(index.len(), 2);
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime_before);
}

#[test]
fn split_writes_one_file_per_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let (mut file, members) = three_member_file();
    file.extend_from_slice(b"TRAILING");
    fs::write(&path, &file).unwrap();

    surgery::split_file(&path, None, false, false).unwrap();
    let pieces: Vec<Vec<u8>> = (1..=4)
        .map(|n| fs::read(dir.path().join(format!("rec{}arc.lz", n))).unwrap())
        .collect();
    assert_eq!(pieces[0], members[0]);
    assert_eq!(pieces[1], members[1]);
    assert_eq!(pieces[2], members[2]);
    assert_eq!(pieces[3], b"TRAILING");
    assert!(!dir.path().join("rec5arc.lz").exists());
}

#[test]
fn nonzero_repair_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    let (file, _) = three_member_file();
    fs::write(&path, &file).unwrap();

    surgery::nonzero_repair(&[path.as_path()], false).unwrap();
    let after_first = fs::read(&path).unwrap();
    // the first LZMA byte of each member is now zero
    let mut f = File::open(&path).unwrap();
    let index = FileIndex::new(&mut f, IndexOptions::default()).unwrap();
    for m in index.members() {
        assert_eq!(after_first[m.mblock.pos() as usize + Header::SIZE], 0);
    }
    // everything else is untouched
    let mut expected = file.clone();
    for m in index.members() {
        expected[m.mblock.pos() as usize + Header::SIZE] = 0;
    }
    assert_eq!(after_first, expected);

    surgery::nonzero_repair(&[path.as_path()], false).unwrap();
    assert_eq!(fs::read(&path).unwrap(), after_first);
}

// ── Recovery engines on undecodable input ─────────────────────────────────────

#[test]
fn byte_repair_rejects_unrepairable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arc.lz");
    fs::write(&path, fake_member(50)).unwrap();

    let out = dir.path().join("fixed.lz");
    let err = repair::byte_repair_file(&path, Some(&out), false, false).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(!out.exists(), "failed repair must not leave an output file");
}

#[test]
fn merge_rejects_identical_and_impossible_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let (file, _) = three_member_file();
    let a = dir.path().join("a.lz");
    let b = dir.path().join("b.lz");
    fs::write(&a, &file).unwrap();
    fs::write(&b, &file).unwrap();
    let out = dir.path().join("m.lz");
    // identical copies cannot be merged
    let err = merge::merge_files(&[a.as_path(), b.as_path()], Some(&out), false, false).unwrap_err();
    assert_eq!(err.exit_code(), 2);

    // distinct single-byte damage in undecodable members cannot merge either,
    // and must fail cleanly instead of looping
    let mut fb = file.clone();
    fb[20] ^= 0x01;
    fs::write(&b, &fb).unwrap();
    let err = merge::merge_files(&[a.as_path(), b.as_path()], Some(&out), false, false).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(!out.exists());
}

// ── FEC end to end ────────────────────────────────────────────────────────────

fn create_params(percent: u64, workers: usize) -> FecCreateParams {
    FecCreateParams {
        count: FecCount::Percent(percent * 1000),
        cl_block_size: 0,
        num_workers: workers,
        fec_level: 9,
        gf16: false,
        random: false,
    }
}

#[test]
fn fec_create_damage_repair_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    let payload = pseudo_random(150_000, 0x9E3779B97F4A7C15);
    fs::write(&payload_path, &payload).unwrap();

    fec::fec_create(&payload_path, None, &create_params(10, 1), false, false).unwrap();
    let fec_path = dir.path().join("payload.bin.fec");
    assert!(fec_path.exists());
    let fec_len = fs::metadata(&fec_path).unwrap().len();
    assert_eq!(fec_len % 4, 0, "fec file size must be a multiple of 4");

    // testing the intact payload succeeds
    fec::fec_test_file(&payload_path, None, None, false, false, false, false).unwrap();

    // zero two sectors of the payload
    let mut damaged = payload.clone();
    damaged[1000..5096].fill(0);
    damaged[80_000..84_096].fill(0);
    fs::write(&payload_path, &damaged).unwrap();

    let err =
        fec::fec_test_file(&payload_path, None, None, false, false, false, false).unwrap_err();
    assert_eq!(err.exit_code(), 2);

    let repaired_path = dir.path().join("repaired.bin");
    fec::fec_test_file(&payload_path, None, Some(&repaired_path), true, false, false, false)
        .unwrap();
    assert_eq!(fs::read(&repaired_path).unwrap(), payload);
}

#[test]
fn fec_parallel_output_is_byte_identical_to_serial() {
    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    fs::write(&payload_path, pseudo_random(300_000, 42)).unwrap();

    let serial = dir.path().join("serial.fec");
    let parallel = dir.path().join("parallel.fec");
    fec::fec_create(&payload_path, Some(&serial), &create_params(15, 1), false, false).unwrap();
    fec::fec_create(&payload_path, Some(&parallel), &create_params(15, 4), false, false).unwrap();
    let a = fs::read(&serial).unwrap();
    let b = fs::read(&parallel).unwrap();
    assert_eq!(a, b, "packet order must not depend on the worker count");
}

#[test]
fn fec_repair_handles_truncated_payload() {
    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    let payload = pseudo_random(40_000, 7);
    fs::write(&payload_path, &payload).unwrap();
    fec::fec_create(&payload_path, None, &create_params(20, 1), false, false).unwrap();

    // truncate the payload: the lost tail blocks must come back from parity
    fs::write(&payload_path, &payload[..39_000]).unwrap();
    let repaired = dir.path().join("repaired.bin");
    fec::fec_test_file(&payload_path, None, Some(&repaired), true, false, false, false).unwrap();
    assert_eq!(fs::read(&repaired).unwrap(), payload);
}

#[test]
fn fec_list_reads_created_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    fs::write(&payload_path, pseudo_random(20_000, 3)).unwrap();
    fec::fec_create(&payload_path, None, &create_params(10, 1), false, false).unwrap();
    let fec_path = dir.path().join("payload.bin.fec");
    fec::fec_list(&[fec_path.as_path()], false).unwrap();
}

// ── Multi-file index from damaged copies ──────────────────────────────────────

#[test]
fn multi_file_index_agrees_with_single() {
    let (file, _) = three_member_file();
    let mut a = file.clone();
    let mut b = file.clone();
    // zero a different member trailer in each copy
    let len = file.len();
    a[len - 20..].fill(0); // member 3 trailer in copy A
    b[0..6].fill(0); // member 1 header in copy B

    let single = FileIndex::new(&mut Cursor::new(file.clone()), IndexOptions::default()).unwrap();
    let mut readers = [Cursor::new(a), Cursor::new(b)];
    let multi = FileIndex::multi(&mut readers, file.len() as u64).unwrap();
    assert_eq!(single.len(), multi.len());
    for i in 0..single.len() {
        assert_eq!(single.member(i).mblock, multi.member(i).mblock);
    }
}
