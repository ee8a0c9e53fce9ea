//! End-to-end scenario tests : format+reopen, growth across a segment boundary,
//! merge-on-overflow, delete-stack rollover, cross-parent rename, and a read-modify-write table.

mod common;

use common::{assert_consistent, format_fresh};
use unfs::facade::OpenMode;
use unfs::Filesystem;

#[test]
fn format_then_reopen_preserves_tree() {
    let (dev, fs) = format_fresh(4096);
    fs.create_dir("/etc", false).unwrap();
    assert_consistent(&fs);
    let handle = fs.file_open("/etc/config", OpenMode::Create).unwrap();
    handle.write(0, b"hello").unwrap();
    handle.close().unwrap();
    assert_consistent(&fs);
    fs.sync().unwrap();

    let reopened = Filesystem::open(dev.path_str()).unwrap();
    assert!(reopened.exists("/etc"));
    assert!(reopened.exists("/etc/config"));
    let handle = reopened.file_open("/etc/config", OpenMode::ReadOnly).unwrap();
    let mut buf = [0u8; 5];
    handle.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    assert_consistent(&reopened);
}

#[test]
fn grow_across_multiple_segments() {
    let (_dev, fs) = format_fresh(8192);
    let handle = fs.file_open("/big", OpenMode::Create).unwrap();
    // Grow in small steps so the file engine cannot always extend the last segment in place,
    // forcing at least one additional segment to be allocated.
    for step in 1..=20u64 {
        handle.resize(step * unfs::PAGE_SIZE as u64 * 3).unwrap();
        assert_consistent(&fs);
    }
    assert_eq!(handle.stat().size, 20 * unfs::PAGE_SIZE as u64 * 3);
}

#[test]
fn merge_on_segment_table_overflow() {
    // Interleave an unrelated one-page filler file after every growth step so the target file
    // can never extend its last segment in place; every step is forced to open a new,
    // non-contiguous segment, which eventually fills the MAXDS-sized segment table and
    // exercises the merge-on-overflow path.
    let (_dev, fs) = format_fresh(32768);
    let handle = fs.file_open("/frag", OpenMode::Create).unwrap();
    for i in 0..(unfs::MAXDS + 4) {
        let current = handle.stat().size;
        handle.resize(current + unfs::PAGE_SIZE as u64).unwrap();
        assert_consistent(&fs);

        let filler = fs.file_open(&format!("/filler{i}"), OpenMode::Create).unwrap();
        filler.resize(unfs::PAGE_SIZE as u64).unwrap();
        filler.close().unwrap();
    }
}

#[test]
fn repeated_create_remove_reuses_delete_stack() {
    let (_dev, fs) = format_fresh(4096);
    for i in 0..64 {
        fs.create_dir(&format!("/d{i}"), false).unwrap();
    }
    assert_consistent(&fs);
    for i in 0..64 {
        fs.remove(&format!("/d{i}"), true).unwrap();
        assert_consistent(&fs);
    }
    for i in 0..64 {
        fs.create_dir(&format!("/e{i}"), false).unwrap();
        assert_consistent(&fs);
    }
}

#[test]
fn rename_moves_subtree_across_parents() {
    let (_dev, fs) = format_fresh(4096);
    fs.create_dir("/a", false).unwrap();
    fs.create_dir("/b", false).unwrap();
    fs.create_dir("/a/inner", false).unwrap();
    let h = fs.file_open("/a/inner/file", OpenMode::Create).unwrap();
    h.write(0, b"payload").unwrap();
    h.close().unwrap();
    assert_consistent(&fs);

    fs.rename("/a/inner", "/b/inner", false).unwrap();
    assert_consistent(&fs);
    assert!(!fs.exists("/a/inner"));
    assert!(fs.exists("/b/inner"));
    assert!(fs.exists("/b/inner/file"));

    let h = fs.file_open("/b/inner/file", OpenMode::ReadOnly).unwrap();
    let mut buf = [0u8; 7];
    h.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
}

#[test]
fn read_modify_write_table_is_checksum_stable() {
    let (_dev, fs) = format_fresh(4096);
    let handle = fs.file_open("/rmw", OpenMode::Create).unwrap();
    handle.resize(unfs::PAGE_SIZE as u64 * 3).unwrap();

    let pattern = vec![0xCCu8; 100];
    for offset in [0u64, 4050, 8190] {
        handle.write(offset, &pattern).unwrap();
        assert_consistent(&fs);
    }
    let first = handle.checksum().unwrap();

    let mut readback = vec![0u8; 100];
    handle.read(4050, &mut readback).unwrap();
    assert_eq!(readback, pattern);

    // Re-writing the exact same bytes must not change the checksum.
    handle.write(4050, &pattern).unwrap();
    let second = handle.checksum().unwrap();
    assert_eq!(first, second);
}

#[test]
fn remove_nonempty_directory_is_rejected() {
    let (_dev, fs) = format_fresh(4096);
    fs.create_dir("/a", false).unwrap();
    fs.create_dir("/a/b", false).unwrap();
    assert!(fs.remove("/a", true).is_err());
}

#[test]
fn exclusive_create_fails_if_present() {
    let (_dev, fs) = format_fresh(4096);
    let h = fs.file_open("/x", OpenMode::CreateExclusive).unwrap();
    h.close().unwrap();
    assert!(fs.file_open("/x", OpenMode::CreateExclusive).is_err());
}

#[test]
fn busy_file_cannot_be_removed() {
    let (_dev, fs) = format_fresh(4096);
    let h = fs.file_open("/busy", OpenMode::Create).unwrap();
    assert!(fs.remove("/busy", false).is_err());
    h.close().unwrap();
    assert!(fs.remove("/busy", false).is_ok());
}

#[test]
fn create_dir_is_idempotent_but_rejects_type_clash() {
    let (_dev, fs) = format_fresh(4096);
    fs.create_dir("/a", false).unwrap();
    fs.create_dir("/a", false).unwrap();
    assert_consistent(&fs);

    let h = fs.file_open("/f", OpenMode::Create).unwrap();
    h.close().unwrap();
    assert!(fs.create_dir("/f", false).is_err());
}

#[test]
fn create_dir_with_pflag_creates_missing_ancestors() {
    let (_dev, fs) = format_fresh(4096);
    fs.create_dir("/a/b/c", true).unwrap();
    assert!(fs.exists("/a"));
    assert!(fs.exists("/a/b"));
    assert!(fs.exists("/a/b/c"));
    assert_consistent(&fs);

    assert!(fs.create_dir("/x/y", false).is_err());
}

#[test]
fn remove_rejects_type_mismatch() {
    let (_dev, fs) = format_fresh(4096);
    fs.create_dir("/a", false).unwrap();
    assert!(fs.remove("/a", false).is_err());
    assert!(fs.remove("/a", true).is_ok());
}

#[test]
fn rename_without_override_fails_on_existing_destination() {
    let (_dev, fs) = format_fresh(4096);
    fs.create_dir("/a", false).unwrap();
    fs.create_dir("/b", false).unwrap();
    assert!(fs.rename("/a", "/b", false).is_err());
}

#[test]
fn rename_with_override_replaces_destination() {
    let (_dev, fs) = format_fresh(4096);
    let h = fs.file_open("/a", OpenMode::Create).unwrap();
    h.write(0, b"new").unwrap();
    h.close().unwrap();
    let old = fs.file_open("/b", OpenMode::Create).unwrap();
    old.close().unwrap();

    fs.rename("/a", "/b", true).unwrap();
    assert_consistent(&fs);
    assert!(!fs.exists("/a"));
    let h = fs.file_open("/b", OpenMode::ReadOnly).unwrap();
    let mut buf = [0u8; 3];
    h.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"new");
}

#[test]
fn renamed_path_survives_reopen() {
    let (dev, fs) = format_fresh(4096);
    fs.create_dir("/a", false).unwrap();
    fs.create_dir("/b", false).unwrap();
    let h = fs.file_open("/a/file", OpenMode::Create).unwrap();
    h.close().unwrap();
    fs.rename("/a/file", "/b/file", false).unwrap();
    fs.sync().unwrap();

    let reopened = Filesystem::open(dev.path_str()).unwrap();
    assert!(!reopened.exists("/a/file"));
    assert!(reopened.exists("/b/file"));
    assert_consistent(&reopened);
}

