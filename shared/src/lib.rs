pub use anyhow::Error;
use std::{env, fs, io, path::Path};
use wireguard_control::Key;

#[cfg(target_os = "linux")]
pub mod netlink;
pub mod resources;
pub mod types;
pub mod wg_config;

pub use types::*;

/// API group all wga resources live under.
pub const GROUP: &str = "wga.kraudcloud.com";
pub const API_VERSION: &str = "wga.kraudcloud.com/v1beta";

/// Data key under which node private keys are stored in their secret.
pub const SECRET_PRIVATE_KEY: &str = "privateKey";

const IN_POD_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// The namespace this process runs in, used to default secret references.
///
/// `POD_NAMESPACE` wins, then the in-pod service account file, then "default".
pub fn pod_namespace() -> String {
    if let Ok(ns) = env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }

    if let Ok(contents) = fs::read_to_string(IN_POD_NAMESPACE_FILE) {
        let ns = contents.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }

    "default".to_string()
}

/// Read a base64 WireGuard key from a file, ignoring surrounding whitespace.
pub fn read_key_file(path: impl AsRef<Path>) -> Result<Key, io::Error> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("cannot read key from {}: {}", path.display(), e),
        )
    })?;
    Key::from_base64(contents.trim()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid base64 key in {}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_key_file_trims_whitespace() {
        let dir = std::env::temp_dir().join("wga-key-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("privateKey");
        fs::write(&path, "2BJtcgPUOahcTcDJUWKIQhyTVlW1eClTSCHhMzmvMlE=\n").unwrap();
        assert!(read_key_file(&path).is_ok());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_key_file_rejects_garbage() {
        let dir = std::env::temp_dir().join("wga-key-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("badKey");
        fs::write(&path, "not a key").unwrap();
        assert!(read_key_file(&path).is_err());
        fs::remove_file(&path).unwrap();
    }
}
