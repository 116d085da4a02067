use std::path::{Path, PathBuf};

/// File names recognised as project configuration, in lookup order.
pub const FABFILE_NAMES: &[&str] = &["fabfile.yaml", "fabfile.yml"];

/// Walk up from `start` looking for a fabfile.
pub fn find_fabfile(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        FABFILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path)
        .map(|p| p.to_string())
        .unwrap_or_else(|_| shellexpand::tilde(path).to_string());
    PathBuf::from(expanded)
}
