//! Serial line plumbing, demo devices and the in-process bus shared by the nyamodbus
//! command line tools.

pub mod demo;
pub mod driver;
pub mod emulator;
pub mod loopback;
pub mod request;
pub mod serial;
