// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod device;
mod path;

use wfs_view::device::MemSectorDevice;
use wfs_view::WfsDevice;

/// Build a fresh, empty filesystem over an in-memory device, the
/// shared starting point for every test in this directory.
fn new_fs() -> WfsDevice {
    let mem = MemSectorDevice::new(vec![0u8; 4096 * 64], 512);
    WfsDevice::create(Box::new(mem), None, 64).unwrap()
}
