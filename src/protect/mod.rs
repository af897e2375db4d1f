//! The hardening pipeline: split each container into kept and nativized methods, generate the
//! native sources, reassemble the multidex set and repackage the APK.
pub mod assembler;
pub mod codegen;
pub mod entry_point;
pub mod filter;
pub mod index;
pub mod native_build;
pub mod pipeline;
pub mod resolver;
pub mod shard;
pub mod strategy;
pub mod templates;
pub mod trampoline;

pub use pipeline::{ProtectReport, Protector};

/// Descriptor of `android.app.Application`, where superclass walks stop.
pub const PLATFORM_APPLICATION_TYPE: &str = "Landroid/app/Application;";
