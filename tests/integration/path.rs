// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use wfs_view::{Path, PathBuf, PathError};

#[test]
fn test_path_from_str_and_bytes_agree() {
    let from_str = Path::try_from("/a/b").unwrap();
    let from_bytes = Path::try_from(b"/a/b".as_slice()).unwrap();
    assert_eq!(from_str, from_bytes);
    assert_eq!(from_str.as_bytes(), b"/a/b");
}

#[test]
fn test_path_buf_round_trips_through_as_path() {
    let buf = PathBuf::try_from("/sub/file.txt").unwrap();
    assert_eq!(buf.as_path().as_bytes(), b"/sub/file.txt");
}

#[test]
fn test_path_rejects_embedded_null() {
    assert_eq!(Path::try_from("a\0b"), Err(PathError::ContainsNull));
    assert_eq!(PathBuf::try_from("a\0b"), Err(PathError::ContainsNull));
}

#[test]
fn test_path_rejects_overlong_component() {
    let long_name = "a".repeat(256);
    assert_eq!(
        Path::try_from(long_name.as_str()),
        Err(PathError::ComponentTooLong)
    );

    // A component exactly at the limit is fine.
    let max_name = "a".repeat(255);
    assert!(Path::try_from(max_name.as_str()).is_ok());
}

#[test]
fn test_path_debug_format_escapes_non_ascii() {
    let path = Path::try_from("abc\n").unwrap();
    assert_eq!(format!("{path:?}"), r"abc\n");
}
