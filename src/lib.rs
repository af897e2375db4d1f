//! # dexnative
//!
//! Moves selected methods of an APK's DEX containers into native code, then rebuilds the
//! multidex set and repackages the archive.
//!
//! ```no_run
//! use dexnative::config::ProtectConfig;
//! use dexnative::protect::Protector;
//! use std::path::Path;
//!
//! let protector = Protector::new(ProtectConfig::default()).unwrap();
//! let report = protector.protect(Path::new("app.apk"), Path::new("app-protected.apk")).unwrap();
//! println!("{} methods moved to native code", report.native_methods);
//! ```

#[macro_use]
pub mod dex;

pub mod android;
pub mod config;
pub mod error;
pub mod protect;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{ProtectError, ProtectResult};
