//! Socket discovery.

use std::path::Path;

use tracing::warn;

/// Suffix that marks a file as a relayable Unix socket.
pub const SOCKET_SUFFIX: &str = ".sock";

/// Base names of the `*.sock` entries directly inside `dir`, sorted.
///
/// Directories are skipped even if their name ends in `.sock`, and so are
/// names that are not valid UTF-8, since mappings report names as strings.
/// Whether a socket is actually accepting connections is checked later.
pub fn discover_sockets(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!(name = ?raw, "Skipping entry with a non-UTF-8 name");
                continue;
            }
        };
        if name.ends_with(SOCKET_SUFFIX) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_sock_entries_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["b.sock", "a.sock", "notes.txt", "sock", "c.socket"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.sock")).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.sock"), b"").unwrap();

        assert_eq!(discover_sockets(dir.path()).unwrap(), vec!["a.sock", "b.sock"]);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn non_utf8_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.sock"), b"").unwrap();
        let raw = OsStr::from_bytes(b"bad\xff.sock");
        std::fs::write(dir.path().join(raw), b"").unwrap();

        assert_eq!(discover_sockets(dir.path()).unwrap(), vec!["ok.sock"]);
    }

    #[test]
    fn empty_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(discover_sockets(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(discover_sockets(&dir.path().join("absent")).is_err());
    }
}
