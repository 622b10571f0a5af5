//! The per-user authentication cookie presented during the handshake.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;

/// Exact size of the cookie file and of the `AUTH` payload.
pub const COOKIE_LENGTH: usize = 256;

/// Environment variable overriding the cookie file location.
pub const COOKIE_ENV: &str = "CADENZA_COOKIE";

const COOKIE_RELATIVE_PATH: &str = ".config/cadenza/cookie";

/// Failure to obtain the cookie. All variants map to
/// [`Code::AuthKey`](crate::Code::AuthKey) at connect time.
#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie file unreadable: {0}")]
    Io(#[from] io::Error),
    #[error("cookie file holds {found} bytes, expected {COOKIE_LENGTH}")]
    WrongLength { found: usize },
    #[error("no home directory to locate the cookie in")]
    NoHome,
}

/// The 256-byte shared secret proving this client belongs to the user
/// the daemon serves.
#[derive(Clone)]
pub struct AuthCookie {
    bytes: [u8; COOKIE_LENGTH],
}

impl std::fmt::Debug for AuthCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret itself.
        f.debug_struct("AuthCookie").finish_non_exhaustive()
    }
}

impl AuthCookie {
    /// Loads the cookie from the default location: `$CADENZA_COOKIE` if
    /// set, otherwise `~/.config/cadenza/cookie`.
    pub fn load() -> Result<Self, CookieError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Loads the cookie from an explicit path. The file must hold
    /// exactly [`COOKIE_LENGTH`] bytes.
    pub fn load_from(path: &Path) -> Result<Self, CookieError> {
        let mut file = fs::File::open(path)?;
        let mut bytes = [0u8; COOKIE_LENGTH];
        file.read_exact(&mut bytes).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                let found = fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0);
                CookieError::WrongLength { found }
            } else {
                CookieError::Io(err)
            }
        })?;
        Ok(Self { bytes })
    }

    /// Loads the cookie, generating a fresh random one with mode 0600
    /// when the file does not exist yet. Connecting never creates the
    /// file implicitly; call this from setup code that should.
    pub fn load_or_create(path: &Path) -> Result<Self, CookieError> {
        match Self::load_from(path) {
            Err(CookieError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                Self::generate(path)
            }
            other => other,
        }
    }

    fn generate(path: &Path) -> Result<Self, CookieError> {
        let mut bytes = [0u8; COOKIE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&bytes)?;
        Ok(Self { bytes })
    }

    /// Where [`AuthCookie::load`] looks.
    pub fn default_path() -> Result<PathBuf, CookieError> {
        if let Some(path) = env::var_os(COOKIE_ENV) {
            return Ok(PathBuf::from(path));
        }
        env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(COOKIE_RELATIVE_PATH))
            .ok_or(CookieError::NoHome)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_round_trips_exact_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        fs::write(&path, [7u8; COOKIE_LENGTH]).unwrap();

        let cookie = AuthCookie::load_from(&path).unwrap();
        assert_eq!(cookie.as_bytes(), &[7u8; COOKIE_LENGTH]);
    }

    #[test]
    fn short_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        fs::write(&path, [0u8; 16]).unwrap();

        match AuthCookie::load_from(&path) {
            Err(CookieError::WrongLength { found }) => assert_eq!(found, 16),
            other => panic!("expected WrongLength, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AuthCookie::load_from(&dir.path().join("absent")),
            Err(CookieError::Io(_))
        ));
    }

    #[test]
    fn load_or_create_generates_once_and_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cookie");

        let first = AuthCookie::load_or_create(&path).unwrap();
        let second = AuthCookie::load_or_create(&path).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, COOKIE_LENGTH);
    }

    #[cfg(unix)]
    #[test]
    fn generated_cookie_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        AuthCookie::load_or_create(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn debug_does_not_leak_the_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        fs::write(&path, [0xAAu8; COOKIE_LENGTH]).unwrap();
        let cookie = AuthCookie::load_from(&path).unwrap();
        let printed = format!("{cookie:?}");
        assert!(!printed.contains("170"));
        assert!(!printed.to_lowercase().contains("aa"));
    }
}
