// Checker and repair scenarios on in-memory volumes
// Each test formats a volume, damages it on the raw bytes, and runs the
// checker with fixed decision policies.

use omfs_core::{FormatOptions, MemoryDevice, SECTOR_SIZE};
use omfs_filesystems::omfs::constants::{
    E_COUNT, E_ENTRIES, H_BODY_SIZE, H_CHECK_XOR, H_MAGIC, H_SELF, OMFS_DIR_START,
    OMFS_EXTENT_START, R_MIRRORS, SENTINEL,
};
use omfs_filesystems::omfs::structures::seal;
use omfs_filesystems::omfs::{
    check_filesystem, compute_in_use, create_filesystem, name_hash, AlwaysAccept, AlwaysDecline,
    CheckReport, Decider, Fault, FaultKind, Link, Session, Writer,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

const BLOCK: usize = 8192;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fresh_volume(sectors: usize) -> MemoryDevice {
    let device = MemoryDevice::new(sectors * SECTOR_SIZE as usize);
    create_filesystem(device, &FormatOptions::default()).unwrap()
}

fn check(device: MemoryDevice, decider: &mut dyn Decider) -> (CheckReport, MemoryDevice) {
    let mut session = Session::open(device).unwrap();
    let report = check_filesystem(&mut session, decider).unwrap();
    (report, session.into_device().unwrap())
}

fn kinds(report: &CheckReport) -> Vec<FaultKind> {
    report.faults.iter().map(|f| f.kind).collect()
}

/// Fault kinds other than the bitmap bytes they leave behind.
fn kinds_besides_bitmap(report: &CheckReport) -> Vec<FaultKind> {
    report
        .faults
        .iter()
        .map(|f| f.kind)
        .filter(|&k| k != FaultKind::BitmapMismatch)
        .collect()
}

/// Apply `f` to the first copy of a metadata block, then recompute its
/// checksums so only the intended damage shows.
fn damage(device: &mut MemoryDevice, block: u64, block_size: usize, f: impl FnOnce(&mut [u8])) {
    let at = block as usize * block_size;
    let sys = &mut device.as_bytes_mut()[at..at + block_size / 4];
    f(sys);
    seal(sys);
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Accept every repair until a run needs no restart, then make sure a
/// declining run finds nothing left.
fn repair_until_clean(mut device: MemoryDevice) -> MemoryDevice {
    for _ in 0..4 {
        let (report, next) = check(device, &mut AlwaysAccept);
        device = next;
        if report.is_success() {
            break;
        }
    }
    let (report, device) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty(), "left over: {:?}", kinds(&report));
    device
}

/// A fresh default volume with one file in the root directory.
fn volume_with_file(name: &str, data: &[u8]) -> (MemoryDevice, u64) {
    let mut session = Session::open(fresh_volume(4096)).unwrap();
    let root = session.root.root_dir;
    let file = Writer::new(&mut session)
        .unwrap()
        .write_file(root, name, data)
        .unwrap();
    session.sync().unwrap();
    (session.into_device().unwrap(), file)
}

const SMALL_BLOCK: usize = 2048;

/// A small-block volume holding one file whose second extent lives in a
/// continuation block.
fn volume_with_continuation() -> (MemoryDevice, u64, u64) {
    let options = FormatOptions {
        block_size: SMALL_BLOCK as u32,
        cluster_size: 1,
        ..Default::default()
    };
    let device = create_filesystem(MemoryDevice::new(1 << 20), &options).unwrap();
    let mut session = Session::open(device).unwrap();
    let root = session.root.root_dir;
    let file = Writer::new(&mut session)
        .unwrap()
        .write_file(root, "long.mpg", &vec![3u8; 2 * SMALL_BLOCK])
        .unwrap();
    session.sync().unwrap();
    let cont = session.codec.read_inode(file).unwrap().extents().unwrap().next;
    assert_ne!(cont, SENTINEL);
    (session.into_device().unwrap(), file, cont)
}

/// Two names that land in the same bucket.
fn colliding_names(buckets: usize) -> (String, String) {
    let mut seen: HashMap<usize, String> = HashMap::new();
    for i in 0.. {
        let name = format!("clip{}", i);
        let bucket = name_hash(name.as_bytes(), buckets);
        if let Some(previous) = seen.insert(bucket, name.clone()) {
            return (previous, name);
        }
    }
    unreachable!()
}

/// Records every fault and answers every question the same way.
struct Scripted {
    answer: bool,
    reported: Vec<Fault>,
    questions: Vec<String>,
}

impl Scripted {
    fn new(answer: bool) -> Self {
        Self {
            answer,
            reported: Vec::new(),
            questions: Vec::new(),
        }
    }
}

impl Decider for Scripted {
    fn report(&mut self, fault: &Fault) {
        self.reported.push(fault.clone());
    }

    fn confirm(&mut self, question: &str) -> bool {
        self.questions.push(question.to_string());
        self.answer
    }
}

#[test]
fn test_clean_volume_is_clean_twice() {
    init();
    let mut session = Session::open(fresh_volume(4096)).unwrap();
    {
        let mut writer = Writer::new(&mut session).unwrap();
        let root = writer.root_dir();
        let docs = writer.create_dir(root, "docs").unwrap();
        writer.write_file(docs, "readme.txt", b"hello omfs").unwrap();
        writer.write_file(root, "movie.mpg", &vec![7u8; 3 * BLOCK]).unwrap();
    }
    let device = session.into_device().unwrap();

    let (first, device) = check(device, &mut AlwaysDecline);
    assert!(first.faults.is_empty(), "unexpected faults: {:?}", kinds(&first));
    assert!(first.is_success());
    assert_eq!(first.inodes_checked, 4);

    let (second, _) = check(device, &mut AlwaysDecline);
    assert_eq!(first, second);
}

#[test]
fn test_fresh_volume_free_count() {
    init();
    let (report, _) = check(fresh_volume(4096), &mut AlwaysDecline);
    assert!(report.is_success());
    assert_eq!(report.free_blocks, Some(256 - 6));
}

#[test]
fn test_crc_corruption_of_root_directory() {
    init();
    let mut device = fresh_volume(4096);
    let mirror_before = device.as_bytes()[4 * BLOCK..4 * BLOCK + 2048].to_vec();

    // flip both CRC bytes by the same mask so the header XOR still holds
    let bytes = device.as_bytes_mut();
    bytes[3 * BLOCK + 12] ^= 0x5a;
    bytes[3 * BLOCK + 13] ^= 0x5a;

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::HeaderCrcMismatch]);
    assert_eq!(report.faults[0].block, 3);
    assert_eq!(report.repaired, 0);

    let mut accept = Scripted::new(true);
    let (report, device) = check(device, &mut accept);
    assert_eq!(kinds(&report), vec![FaultKind::HeaderCrcMismatch]);
    assert_eq!(report.repaired, 1);
    assert!(!report.restart_required);
    assert_eq!(accept.questions, vec!["Correct?".to_string()]);

    let (report, device) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty());
    assert_eq!(device.as_bytes()[4 * BLOCK..4 * BLOCK + 2048], mirror_before[..]);
}

#[test]
fn test_root_block_checksum_repair() {
    init();
    let mut device = fresh_volume(4096);
    // a byte of the name field: body only, so the XOR still holds
    device.as_bytes_mut()[BLOCK + 200] = 0xee;

    let (report, device) = check(device, &mut AlwaysAccept);
    assert_eq!(kinds(&report), vec![FaultKind::HeaderCrcMismatch]);
    assert_eq!(report.repaired, 1);

    let (report, _) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty());
}

#[test]
fn test_renamed_file_moves_to_its_bucket() {
    init();
    let mut session = Session::open(fresh_volume(4096)).unwrap();
    let root = session.root.root_dir;
    let file = Writer::new(&mut session).unwrap().create_file(root, "alpha").unwrap();

    // rename behind the directory's back
    let mut inode = session.codec.read_inode(file).unwrap();
    inode.name = b"blpha".to_vec();
    session.codec.rewrite_inode(&mut inode).unwrap();
    let buckets = session.bucket_count();
    let old_bucket = name_hash(b"alpha", buckets);
    let new_bucket = name_hash(b"blpha", buckets);
    assert_ne!(old_bucket, new_bucket);
    let device = session.into_device().unwrap();

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::HashMismatch]);
    let pos = report.faults[0].position.unwrap();
    assert_eq!(pos.bucket, Some(old_bucket));

    let (report, device) = check(device, &mut AlwaysAccept);
    assert_eq!(report.count(FaultKind::HashMismatch), 1);
    assert!(report.restart_required);
    assert!(!report.is_success());

    let (report, device) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty(), "unexpected faults: {:?}", kinds(&report));

    let mut session = Session::open(device).unwrap();
    let dir = session.codec.read_inode(root).unwrap();
    assert_eq!(dir.buckets().unwrap()[old_bucket], SENTINEL);
    assert_eq!(dir.buckets().unwrap()[new_bucket], file);
    let writer = Writer::new(&mut session).unwrap();
    assert_eq!(writer.lookup(root, "blpha").unwrap(), Some(file));
    assert_eq!(writer.lookup(root, "alpha").unwrap(), None);
}

#[test]
fn test_sibling_loop_detected_and_cut() {
    init();
    let mut session = Session::open(fresh_volume(4096)).unwrap();
    let root = session.root.root_dir;
    let (a, b) = colliding_names(session.bucket_count());
    let (first, second) = {
        let mut writer = Writer::new(&mut session).unwrap();
        let first = writer.create_file(root, &a).unwrap();
        let second = writer.create_file(root, &b).unwrap();
        (first, second)
    };

    // second is the bucket head and points at first; close the circle
    let mut tail = session.codec.read_inode(first).unwrap();
    assert_eq!(session.codec.read_inode(second).unwrap().sibling, first);
    tail.sibling = second;
    session.codec.write_inode(&mut tail).unwrap();
    let device = session.into_device().unwrap();

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::Loop]);
    assert_eq!(report.faults[0].block, second);
    assert!(report.bitmap_ok);

    let mut accept = Scripted::new(true);
    let (report, device) = check(device, &mut accept);
    assert!(report.restart_required);
    assert_eq!(accept.questions, vec!["Delete the offending file?".to_string()]);

    let (report, device) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty(), "unexpected faults: {:?}", kinds(&report));
    let session = Session::open(device).unwrap();
    assert_eq!(session.codec.read_inode(first).unwrap().sibling, SENTINEL);
}

#[test]
fn test_parent_pointer_fault_unlinks_file() {
    init();
    let mut session = Session::open(fresh_volume(4096)).unwrap();
    let root = session.root.root_dir;
    let (dir, stray) = {
        let mut writer = Writer::new(&mut session).unwrap();
        let dir = writer.create_dir(root, "photos").unwrap();
        let stray = writer.create_file(dir, "img.jpg").unwrap();
        (dir, stray)
    };
    let mut inode = session.codec.read_inode(stray).unwrap();
    inode.parent = root;
    session.codec.write_inode(&mut inode).unwrap();
    let device = session.into_device().unwrap();

    let mut decline = Scripted::new(false);
    let (report, device) = check(device, &mut decline);
    assert_eq!(kinds(&report), vec![FaultKind::ParentPointerMismatch]);
    assert_eq!(report.declined, 1);
    assert_eq!(decline.reported.len(), 1);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.restart_required);

    // the inode's blocks are now unreferenced, so the bitmap is stale
    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(report.count(FaultKind::ParentPointerMismatch), 0);
    assert!(report.count(FaultKind::BitmapMismatch) > 0);
    assert!(!report.bitmap_ok);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.bitmap_ok);
    let (report, device) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty());

    let mut session = Session::open(device).unwrap();
    let writer = Writer::new(&mut session).unwrap();
    assert_eq!(writer.lookup(dir, "img.jpg").unwrap(), None);
}

#[test]
fn test_bitmap_mismatch_rebuild() {
    init();
    let mut session = Session::open(fresh_volume(4096)).unwrap();
    let root = session.root.root_dir;
    let file = Writer::new(&mut session).unwrap().create_file(root, "a.mpg").unwrap();
    let mut device = session.into_device().unwrap();

    // forget that the inode's first block is taken
    let byte = 5 * BLOCK + (file / 8) as usize;
    device.as_bytes_mut()[byte] &= !(1 << (file % 8));

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::BitmapMismatch]);
    assert!(!report.bitmap_ok);
    assert!(!report.is_success());
    let mismatch = report.faults[0].bitmap.unwrap();
    assert_eq!(mismatch.offset, file / 8);

    let mut accept = Scripted::new(true);
    let (report, device) = check(device, &mut accept);
    assert!(report.bitmap_ok);
    assert_eq!(accept.questions, vec!["Rebuild?".to_string()]);

    let (report, _) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty());
    assert!(report.is_success());
}

#[test]
fn test_read_only_check_writes_nothing() {
    init();
    let mut device = fresh_volume(4096);
    device.as_bytes_mut()[3 * BLOCK + 12] ^= 0x11;
    device.as_bytes_mut()[3 * BLOCK + 13] ^= 0x11;
    let before = device.as_bytes().to_vec();

    let mut session = Session::open_read_only(device).unwrap();
    let mut accept = Scripted::new(true);
    let report = check_filesystem(&mut session, &mut accept).unwrap();
    assert_eq!(kinds(&report), vec![FaultKind::HeaderCrcMismatch]);
    assert_eq!(report.declined, 1);
    assert!(accept.questions.is_empty());
    assert_eq!(session.into_device().unwrap().as_bytes(), &before[..]);
}

#[test]
fn test_random_trees_keep_bitmap_in_step() {
    init();
    let options = FormatOptions {
        block_size: 2048,
        cluster_size: 1,
        ..Default::default()
    };

    for seed in 0..4u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let device = create_filesystem(MemoryDevice::new(16 << 20), &options).unwrap();
        let mut session = Session::open(device).unwrap();
        let mut files = Vec::new();
        {
            let mut writer = Writer::new(&mut session).unwrap();
            let mut dirs = vec![writer.root_dir()];
            for i in 0..40 {
                let parent = dirs[rng.gen_range(0..dirs.len())];
                if rng.gen_bool(0.3) {
                    dirs.push(writer.create_dir(parent, &format!("dir{}", i)).unwrap());
                } else {
                    let len = rng.gen_range(0..20_000);
                    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    let block = writer.write_file(parent, &format!("file{}", i), &data).unwrap();
                    files.push((block, data));
                }
            }
            for (block, data) in &files {
                assert_eq!(&writer.read_file(*block).unwrap(), data);
            }
        }

        let computed = compute_in_use(&session).unwrap();
        let persisted = session.free_space().unwrap().bitmap().clone();
        assert!(computed.diff(&persisted).is_empty(), "seed {}", seed);

        let device = session.into_device().unwrap();
        let (report, _) = check(device, &mut AlwaysDecline);
        assert!(report.faults.is_empty(), "seed {}: {:?}", seed, kinds(&report));
        assert_eq!(report.free_blocks, Some(persisted.count_free()));
    }
}

#[test]
fn test_insane_body_size_unlinks_file() {
    init();
    let (mut device, file) = volume_with_file("huge.mpg", b"x");
    damage(&mut device, file, BLOCK, |b| {
        b[H_BODY_SIZE..H_BODY_SIZE + 4].copy_from_slice(&5000u32.to_be_bytes())
    });

    let mut decline = Scripted::new(false);
    let (report, device) = check(device, &mut decline);
    assert_eq!(kinds_besides_bitmap(&report), vec![FaultKind::Insane]);
    assert_eq!(report.faults[0].block, file);
    assert_eq!(report.declined, 1);
    // the skipped inode leaves the scan incomplete, so no rebuild is offered
    assert_eq!(decline.questions, vec!["Delete the offending file?".to_string()]);
    assert_eq!(decline.reported, report.faults);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert_eq!(kinds(&report), vec![FaultKind::Insane]);
    assert!(report.restart_required);

    let mut session = Session::open(repair_until_clean(device)).unwrap();
    let root = session.root.root_dir;
    let writer = Writer::new(&mut session).unwrap();
    assert_eq!(writer.lookup(root, "huge.mpg").unwrap(), None);
}

#[test]
fn test_self_pointer_mismatch_unlinks_file() {
    init();
    let (mut device, file) = volume_with_file("a.mpg", b"");
    damage(&mut device, file, BLOCK, |b| put_u64(b, H_SELF, 200));

    let mut decline = Scripted::new(false);
    let (report, device) = check(device, &mut decline);
    assert_eq!(kinds(&report), vec![FaultKind::SelfPointerMismatch]);
    assert_eq!(report.faults[0].block, file);
    assert_eq!(report.declined, 1);
    assert!(report.bitmap_ok);
    assert_eq!(decline.questions, vec!["Delete the offending file?".to_string()]);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.restart_required);
    repair_until_clean(device);
}

#[test]
fn test_lone_xor_mismatch_is_rewritten() {
    init();
    let (mut device, file) = volume_with_file("a.mpg", b"abc");
    device.as_bytes_mut()[file as usize * BLOCK + H_CHECK_XOR] ^= 0xff;

    let mut decline = Scripted::new(false);
    let (report, device) = check(device, &mut decline);
    assert_eq!(kinds(&report), vec![FaultKind::HeaderXorMismatch]);
    assert_eq!(report.declined, 1);
    assert_eq!(decline.questions, vec!["Correct?".to_string()]);

    let mut accept = Scripted::new(true);
    let (report, device) = check(device, &mut accept);
    assert_eq!(kinds(&report), vec![FaultKind::HeaderXorMismatch]);
    assert_eq!(report.repaired, 1);
    assert!(!report.restart_required);

    let (report, _) = check(device, &mut AlwaysDecline);
    assert!(report.faults.is_empty(), "unexpected faults: {:?}", kinds(&report));
}

#[test]
fn test_inode_magic_is_reported_only() {
    init();
    let (mut device, file) = volume_with_file("a.mpg", b"abc");
    damage(&mut device, file, BLOCK, |b| b[H_MAGIC] = 0x00);

    let mut accept = Scripted::new(true);
    let (report, _) = check(device, &mut accept);
    assert_eq!(kinds(&report), vec![FaultKind::InodeMagic]);
    assert_eq!(report.repaired, 0);
    assert_eq!(report.declined, 0);
    assert!(accept.questions.is_empty());
}

#[test]
fn test_extent_count_past_the_block() {
    init();
    let (mut device, file) = volume_with_file("clip.mpg", &[1u8; 100]);
    damage(&mut device, file, BLOCK, |b| {
        let at = OMFS_EXTENT_START + E_COUNT;
        b[at..at + 4].copy_from_slice(&10_000u32.to_be_bytes())
    });

    let mut accept = Scripted::new(true);
    let (report, _) = check(device, &mut accept);
    assert_eq!(kinds_besides_bitmap(&report), vec![FaultKind::ExtentCount]);
    // the file's data is no longer accounted for, and the bitmap is kept
    assert!(report.count(FaultKind::BitmapMismatch) > 0);
    assert!(!report.bitmap_ok);
    assert_eq!(report.repaired, 0);
    assert!(accept.questions.is_empty());
}

#[test]
fn test_extent_terminator_mismatch() {
    init();
    let (mut device, file) = volume_with_file("clip.mpg", &[1u8; 100]);
    // blocks field of the terminator, which follows the single allocation
    damage(&mut device, file, BLOCK, |b| {
        put_u64(b, OMFS_EXTENT_START + E_ENTRIES + 16 + 8, 12345)
    });

    let mut accept = Scripted::new(true);
    let (report, _) = check(device, &mut accept);
    assert_eq!(kinds(&report), vec![FaultKind::ExtentTerminator]);
    assert!(report.bitmap_ok);
    assert!(accept.questions.is_empty());
}

#[test]
fn test_extent_outside_the_volume() {
    init();
    let (mut device, file) = volume_with_file("clip.mpg", &[1u8; 100]);
    damage(&mut device, file, BLOCK, |b| {
        put_u64(b, OMFS_EXTENT_START + E_ENTRIES, 0x1000)
    });

    let mut decline = Scripted::new(false);
    let (report, _) = check(device, &mut decline);
    assert_eq!(kinds_besides_bitmap(&report), vec![FaultKind::ExtentRange]);
    assert!(report.faults[0].detail.contains("0x1000"));
    // the real cluster is now unreferenced; only the rebuild is offered
    assert!(!report.bitmap_ok);
    assert_eq!(decline.questions, vec!["Rebuild?".to_string()]);
}

#[test]
fn test_mirror_count_disagreement() {
    init();
    let mut device = fresh_volume(4096);
    damage(&mut device, 1, BLOCK, |b| put_u64(b, R_MIRRORS, 3));

    let mut accept = Scripted::new(true);
    let (report, _) = check(device, &mut accept);
    assert_eq!(kinds(&report), vec![FaultKind::MirrorCount]);
    assert_eq!(report.faults[0].block, 1);
    assert_eq!(report.repaired, 0);
    assert!(accept.questions.is_empty());
}

#[test]
fn test_bucket_pointer_outside_volume_is_cut() {
    init();
    let mut device = fresh_volume(4096);
    damage(&mut device, 3, BLOCK, |b| put_u64(b, OMFS_DIR_START + 4 * 8, 100_000));

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::PointerOutOfRange]);
    assert_eq!(report.faults[0].block, 100_000);
    let pos = report.faults[0].position.unwrap();
    assert_eq!(pos.via, Link::Bucket { dir: 3, index: 4 });
    assert_eq!(report.declined, 1);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.restart_required);

    let session = Session::open(repair_until_clean(device)).unwrap();
    assert_eq!(session.codec.read_inode(3).unwrap().buckets().unwrap()[4], SENTINEL);
}

#[test]
fn test_continuation_loop_is_cut() {
    init();
    let (device, file, cont) = volume_with_continuation();
    let mut session = Session::open(device).unwrap();
    let mut inode = session.codec.read_inode(cont).unwrap();
    inode.extents_mut().unwrap().next = cont;
    session.codec.rewrite_inode(&mut inode).unwrap();
    let device = session.into_device().unwrap();

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::Loop]);
    assert_eq!(report.faults[0].block, cont);
    let pos = report.faults[0].position.unwrap();
    assert_eq!(pos.via, Link::Continuation { owner: cont });
    assert_eq!(report.declined, 1);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.restart_required);

    let mut session = Session::open(repair_until_clean(device)).unwrap();
    assert_eq!(session.codec.read_inode(cont).unwrap().extents().unwrap().next, SENTINEL);
    let writer = Writer::new(&mut session).unwrap();
    assert_eq!(writer.read_file(file).unwrap(), vec![3u8; 2 * SMALL_BLOCK]);
}

#[test]
fn test_continuation_pointer_outside_volume_is_cut() {
    init();
    let (device, _, cont) = volume_with_continuation();
    let mut session = Session::open(device).unwrap();
    let mut inode = session.codec.read_inode(cont).unwrap();
    inode.extents_mut().unwrap().next = 1_000_000;
    session.codec.rewrite_inode(&mut inode).unwrap();
    let device = session.into_device().unwrap();

    let (report, device) = check(device, &mut AlwaysDecline);
    assert_eq!(kinds(&report), vec![FaultKind::PointerOutOfRange]);
    assert_eq!(report.faults[0].block, 1_000_000);
    assert_eq!(
        report.faults[0].position.unwrap().via,
        Link::Continuation { owner: cont }
    );
    assert_eq!(report.declined, 1);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.restart_required);

    let session = Session::open(repair_until_clean(device)).unwrap();
    assert_eq!(session.codec.read_inode(cont).unwrap().extents().unwrap().next, SENTINEL);
}

#[test]
fn test_continuation_self_pointer_cuts_chain() {
    init();
    let (mut device, file, cont) = volume_with_continuation();
    damage(&mut device, cont, SMALL_BLOCK, |b| put_u64(b, H_SELF, cont + 100));

    let mut decline = Scripted::new(false);
    let (report, device) = check(device, &mut decline);
    assert_eq!(kinds_besides_bitmap(&report), vec![FaultKind::SelfPointerMismatch]);
    assert_eq!(report.faults[0].block, cont);
    assert_eq!(
        report.faults[0].position.unwrap().via,
        Link::Continuation { owner: file }
    );
    assert_eq!(report.declined, 1);
    assert_eq!(decline.questions, vec!["Delete the offending file?".to_string()]);

    let (report, device) = check(device, &mut AlwaysAccept);
    assert!(report.restart_required);

    let session = Session::open(repair_until_clean(device)).unwrap();
    assert_eq!(session.codec.read_inode(file).unwrap().extents().unwrap().next, SENTINEL);
}
