#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

mod error;
pub mod hal;
pub mod mmc;

pub use error::*;
pub use hal::{Millis, Platform, Work};

use hal::*;
