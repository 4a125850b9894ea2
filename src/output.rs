use std::{ collections::BTreeMap, fs::{ self, File }, io::{ BufWriter, Write }, path::{ Path, PathBuf } };

use anyhow::{ Result, Context };
use tracing::{ debug, error };

pub const DEFAULT_DIR: &str = "parsedService";

/// File name for a service key: the part before `@`, with path separators
/// replaced, plus `.txt`.
pub fn file_name(service_key: &str) -> String {
    let name = service_key.split_once('@').map_or(service_key, |(n, _)| n);
    let name = if name.is_empty() { "unknown" } else { name };
    format!("{}.txt", name.replace(['/', '\\'], "_"))
}

fn write_address_list(path: &Path, addresses: &[&str]) -> Result<()> {
    let file = File::create(path).context(format!("cannot create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for a in addresses {
        writeln!(w, "{}", a)?;
    }
    w.flush().context(format!("cannot write {}", path.display()))?;
    Ok(())
}

/// Writes one address list per service file under `dir`. Keys sharing a
/// file name (same service, different versions) are written to the same
/// file in key order. A failed file is logged and skipped; only failing to
/// create `dir` is an error.
pub fn save_address_lists(
    dir: &Path,
    by_service: &BTreeMap<String, Vec<String>>
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).context(format!("cannot create output directory {}", dir.display()))?;

    let mut files: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (key, addresses) in by_service {
        files
            .entry(file_name(key))
            .or_default()
            .extend(addresses.iter().map(String::as_str));
    }

    let mut written = vec![];
    for (name, addresses) in files {
        let path = dir.join(name);
        if let Err(e) = write_address_list(&path, &addresses) {
            error!("{:?}", e);
            continue;
        }
        debug!(count = addresses.len(), "wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{ AtomicU64, Ordering };

    use super::*;

    fn scratch_dir() -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(
            format!("nmap-vuln-viz-output-test-{}-{seq}", std::process::id())
        );
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("ssh@7.4p1"), "ssh.txt");
        assert_eq!(file_name("http@"), "http.txt");
        assert_eq!(file_name("Undefined service"), "Undefined service.txt");
        assert_eq!(file_name("ms-wbt-server@10.0@x"), "ms-wbt-server.txt");
        assert_eq!(file_name("a/b@1"), "a_b.txt");
        assert_eq!(file_name("@1"), "unknown.txt");
    }

    #[test]
    fn test_save_address_lists() {
        let dir = scratch_dir().join(DEFAULT_DIR);
        let by_service = BTreeMap::from([
            ("ssh@7.4p1".to_owned(), vec!["10.0.0.1".to_owned(), "10.0.0.3".to_owned()]),
            ("ssh@8.0".to_owned(), vec!["10.0.0.7".to_owned()]),
            ("http@2.4.1".to_owned(), vec!["10.0.0.2".to_owned()]),
            ("Undefined service".to_owned(), vec!["unknown".to_owned()]),
        ]);
        let written = save_address_lists(&dir, &by_service).unwrap();
        assert_eq!(written.len(), 3);

        let ssh = fs::read_to_string(dir.join("ssh.txt")).unwrap();
        assert_eq!(ssh, "10.0.0.1\n10.0.0.3\n10.0.0.7\n");
        let http = fs::read_to_string(dir.join("http.txt")).unwrap();
        assert_eq!(http, "10.0.0.2\n");
        let undefined = fs::read_to_string(dir.join("Undefined service.txt")).unwrap();
        assert_eq!(undefined, "unknown\n");

        // rerun overwrites rather than appends
        save_address_lists(&dir, &by_service).unwrap();
        let http = fs::read_to_string(dir.join("http.txt")).unwrap();
        assert_eq!(http, "10.0.0.2\n");
    }

    #[test]
    fn test_save_nothing() {
        let dir = scratch_dir();
        let written = save_address_lists(&dir, &BTreeMap::new()).unwrap();
        assert!(written.is_empty());
        assert!(dir.is_dir());
    }
}
