//! APK level plumbing: archive entries, the compiled manifest and repackaging.
pub mod apk;
pub mod manifest;
pub mod repackage;
