//! Filesystem-backed list store.
//!
//! Inline `hosts` entries come straight from the config. `file` lists are
//! read from their configured path; `url` lists are read from the store
//! directory, where the list updater leaves them as `<name>.lst`.

use anyhow::{Context as _, Result};
use pbr_resolver::config::ListConfig;
use pbr_resolver::lists::ListStore;
use std::path::PathBuf;

pub struct FsListStore {
    dir: PathBuf,
}

impl FsListStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl ListStore for FsListStore {
    fn domains(&self, list: &ListConfig) -> Result<Vec<String>> {
        if !list.hosts.is_empty() {
            return Ok(list.hosts.clone());
        }

        let path = match &list.file {
            Some(file) => file.clone(),
            None => self.dir.join(format!("{}.lst", list.name)),
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read list file {}", path.display()))?;

        Ok(content.lines().map(str::to_owned).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn list(name: &str) -> ListConfig {
        ListConfig {
            name: name.to_owned(),
            hosts: Vec::new(),
            file: None,
            url: None,
        }
    }

    #[test]
    fn inline_hosts_bypass_the_filesystem() {
        let store = FsListStore::new(PathBuf::from("/nonexistent"));
        let list = ListConfig {
            hosts: vec!["example.com".to_owned()],
            ..list("inline")
        };

        assert_eq!(store.domains(&list).unwrap(), vec!["example.com".to_owned()]);
    }

    #[test]
    fn file_lists_read_their_configured_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "example.com").unwrap();
        writeln!(file, "# comment").unwrap();

        let store = FsListStore::new(PathBuf::from("/nonexistent"));
        let list = ListConfig {
            file: Some(file.path().to_owned()),
            ..list("file-backed")
        };

        assert_eq!(
            store.domains(&list).unwrap(),
            vec!["example.com".to_owned(), "# comment".to_owned()]
        );
    }

    #[test]
    fn url_lists_resolve_inside_the_store_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remote.lst"), "example.net\n").unwrap();

        let store = FsListStore::new(dir.path().to_owned());
        let list = ListConfig {
            url: Some("https://lists.example/remote.lst".parse().unwrap()),
            ..list("remote")
        };

        assert_eq!(store.domains(&list).unwrap(), vec!["example.net".to_owned()]);
    }

    #[test]
    fn missing_files_surface_an_error() {
        let store = FsListStore::new(PathBuf::from("/nonexistent"));

        assert!(store.domains(&list("ghost")).is_err());
    }
}
