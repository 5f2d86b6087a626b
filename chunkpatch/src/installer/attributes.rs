//! File attribute stage. Failures are logged, never fatal.

use std::path::Path;

use crate::fs::FileSystem;
use crate::manifest::BuildManifest;

/// Apply manifest attributes to `files` under `dir`.
///
/// Files whose attributes are default in both builds are skipped. Returns the
/// number of files that could not be updated.
pub fn apply_file_attributes<'a>(
    fs: &dyn FileSystem,
    manifest: &BuildManifest,
    current: Option<&BuildManifest>,
    dir: &Path,
    files: impl IntoIterator<Item = &'a String>,
) -> usize {
    let mut failures = 0;
    for name in files {
        let Some(file) = manifest.file(name) else {
            continue;
        };
        let previously_set = current
            .and_then(|m| m.file(name))
            .is_some_and(|f| !f.attributes.is_default());
        if file.attributes.is_default() && !previously_set {
            continue;
        }

        let path = dir.join(name);
        if let Err(e) = fs.set_attributes(&path, &file.attributes) {
            tracing::warn!(file = %name, error = %e, "Could not set file attributes");
            failures += 1;
        }
    }
    failures
}
