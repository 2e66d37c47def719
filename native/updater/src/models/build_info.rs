use time::OffsetDateTime;

/// Descriptor of the build offered by the OTA server.
///
/// Never edited field by field; a newer offer replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub release_date: OffsetDateTime,
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    /// Lowercase hex md5 of the package.
    pub checksum: String,
}

impl BuildInfo {
    /// File name safe to join onto a local directory, `None` if nothing usable is left.
    pub fn local_file_name(&self) -> Option<String> {
        let name = sanitize_filename::sanitize(self.file_name.trim());
        (!name.is_empty()).then_some(name)
    }
}
