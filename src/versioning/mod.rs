/*!
Versioning tracks the set of live table files.

A [`Version`](version::Version) is an immutable snapshot of the per-level
file lists. The [`VersionSet`](version_set::VersionSet) owns the current
version, appends [`VersionEdit`](version_edit::VersionEdit) records to the
manifest to persist transitions, and rebuilds the newest version from the
manifest on recovery.
*/

pub(crate) mod file_metadata;
pub(crate) mod version;
pub(crate) mod version_builder;
pub(crate) mod version_edit;
pub(crate) mod version_set;
