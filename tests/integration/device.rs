// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::new_fs;
use wfs_view::{Path, WfsError};

#[test]
fn test_create_starts_with_an_empty_root() {
    let fs = new_fs();
    let root = Path::try_from("/").unwrap();
    assert!(fs.list_directory(root).unwrap().is_empty());

    let metadata = fs.get_entry(root).unwrap();
    assert!(metadata.is_dir());
}

#[test]
fn test_create_file_write_then_read_back() {
    let fs = new_fs();
    let path = Path::try_from("/hello.txt").unwrap();

    fs.create_file(path).unwrap();
    fs.write_file(path, b"hello, world!").unwrap();

    assert_eq!(fs.read_file(path).unwrap(), b"hello, world!");

    let metadata = fs.get_entry(path).unwrap();
    assert!(!metadata.is_dir());
    assert!(!metadata.is_symlink());
    assert_eq!(metadata.len(), 13);
}

#[test]
fn test_overwrite_shrinks_file() {
    let fs = new_fs();
    let path = Path::try_from("/a.txt").unwrap();

    fs.create_file(path).unwrap();
    fs.write_file(path, b"a long first write").unwrap();
    fs.write_file(path, b"short").unwrap();

    assert_eq!(fs.read_file(path).unwrap(), b"short");
}

#[test]
fn test_nested_directory_and_file() {
    let fs = new_fs();
    let dir = Path::try_from("/sub").unwrap();
    fs.create_directory(dir).unwrap();

    let file = Path::try_from("/sub/a.txt").unwrap();
    fs.create_file(file).unwrap();
    fs.write_file(file, b"nested data").unwrap();

    assert_eq!(fs.read_file(file).unwrap(), b"nested data");

    let entries = fs.list_directory(dir).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, b"a.txt");

    let root_entries = fs.list_directory(Path::try_from("/").unwrap()).unwrap();
    assert_eq!(root_entries.len(), 1);
    assert_eq!(root_entries[0].0, b"sub");
    assert!(root_entries[0].1.is_dir());
}

#[test]
fn test_deeply_nested_directories() {
    let fs = new_fs();
    fs.create_directory(Path::try_from("/a").unwrap()).unwrap();
    fs.create_directory(Path::try_from("/a/b").unwrap())
        .unwrap();
    fs.create_directory(Path::try_from("/a/b/c").unwrap())
        .unwrap();

    let file = Path::try_from("/a/b/c/leaf.bin").unwrap();
    fs.create_file(file).unwrap();
    fs.write_file(file, &[1, 2, 3, 4]).unwrap();

    assert_eq!(fs.read_file(file).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_create_file_rejects_duplicate_name() {
    let fs = new_fs();
    let path = Path::try_from("/dup.txt").unwrap();
    fs.create_file(path).unwrap();
    assert!(fs.create_file(path).is_err());
}

#[test]
fn test_get_entry_missing_path_not_found() {
    let fs = new_fs();
    let path = Path::try_from("/does/not/exist").unwrap();
    assert!(matches!(fs.get_entry(path), Err(WfsError::ItemNotFound)));
}

#[test]
fn test_create_file_under_missing_directory_fails() {
    let fs = new_fs();
    let path = Path::try_from("/missing/a.txt").unwrap();
    assert!(matches!(
        fs.create_file(path),
        Err(WfsError::ItemNotFound)
    ));
}

#[test]
fn test_write_then_read_large_file_migrates_storage_category() {
    let fs = new_fs();
    let path = Path::try_from("/big.bin").unwrap();
    fs.create_file(path).unwrap();

    let data = vec![0xab; 64 * 1024];
    fs.write_file(path, &data).unwrap();

    assert_eq!(fs.read_file(path).unwrap(), data);
    assert_eq!(fs.get_entry(path).unwrap().len(), data.len() as u64);
}

#[test]
fn test_flush_on_an_untouched_filesystem_succeeds() {
    let fs = new_fs();
    fs.flush().unwrap();
}
