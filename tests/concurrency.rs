//! Concurrency stress test : many threads creating, writing and removing distinct
//! files at once, followed by a `check()`. Grounded on `txn`'s own lock-manager tests
//! (`Arc` + `thread::spawn` + a barrier to line up contention), adapted from lock acquisition
//! races to façade-operation races.

mod common;

use std::sync::Barrier;

use common::{assert_consistent, format_fresh};
use unfs::facade::OpenMode;

#[test]
fn concurrent_file_creation_and_io_stays_consistent() {
    let (_dev, fs) = format_fresh(16384);
    fs.create_dir("/work", false).unwrap();

    const THREADS: usize = 16;
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|scope| {
        for id in 0..THREADS {
            let fs = fs.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                let path = format!("/work/file{id}");
                let handle = fs.file_open(&path, OpenMode::CreateExclusive).unwrap();
                let payload = vec![id as u8; 64];
                handle.write(0, &payload).unwrap();
                let mut out = vec![0u8; 64];
                handle.read(0, &mut out).unwrap();
                assert_eq!(out, payload);
                handle.close().unwrap();
            });
        }
    });

    assert_consistent(&fs);
    assert_eq!(fs.dir_list("/work").unwrap().len(), THREADS);

    std::thread::scope(|scope| {
        for id in 0..THREADS {
            let fs = fs.clone();
            scope.spawn(move || {
                let path = format!("/work/file{id}");
                fs.remove(&path, false).unwrap();
            });
        }
    });

    assert_consistent(&fs);
    assert_eq!(fs.dir_list("/work").unwrap().len(), 0);
}

#[test]
fn two_threads_racing_on_distinct_files_never_corrupt_each_other() {
    let (_dev, fs) = format_fresh(4096);
    let a = fs.file_open("/a", OpenMode::Create).unwrap();
    let b = fs.file_open("/b", OpenMode::Create).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..200u8 {
                a.write(0, &[i; 16]).unwrap();
            }
        });
        scope.spawn(|| {
            for i in 0..200u8 {
                b.write(0, &[i; 16]).unwrap();
            }
        });
    });

    let mut buf = [0u8; 16];
    a.read(0, &mut buf).unwrap();
    assert_eq!(buf, [199u8; 16]);
    b.read(0, &mut buf).unwrap();
    assert_eq!(buf, [199u8; 16]);
    assert_consistent(&fs);
}
