//! Chunkpatch - chunk-based build installation and patching
//!
//! A build is described by a [`BuildManifest`](manifest::BuildManifest): its
//! files, each an ordered list of parts cut from content-addressed chunks.
//! The [`Installer`](installer::Installer) turns an install directory into a
//! given build by constructing only the files that changed, taking chunk data
//! from the cheapest place that has it:
//!
//! ```text
//!   chunk databases ─┐
//!   installed builds ├─► ChainedChunkSource ─► FileConstructor ─► staging
//!   cloud (HTTP)  ───┘          │                                   │
//!                        MemoryChunkStore                     move, verify
//!                        + disk overflow                            │
//!                                                            install directory
//! ```

pub mod checksum;
pub mod chunks;
pub mod config;
pub mod constructor;
pub mod control;
pub mod fs;
pub mod http;
pub mod installer;
pub mod logging;
pub mod manifest;
pub mod message;
pub mod source;
pub mod stats;

pub use config::{InstallerConfiguration, PatchTuning, VerifyMode};
pub use installer::{
    BuildStats, InstallErrorKind, InstallState, Installer, InstallerBuilder,
};
pub use manifest::{BuildManifest, ChunkId};
