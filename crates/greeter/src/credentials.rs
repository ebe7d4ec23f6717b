//! systemd-style credential lookup
//!
//! A credential `name` is read from `$CREDENTIALS_DIRECTORY/<name>` when that
//! file exists, otherwise from the environment variable `<NAME>`. Values are
//! trimmed and cached for the lifetime of the process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing::debug;

/// Credential lookup errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential '{name}' not found in $CREDENTIALS_DIRECTORY/{name} or ${env}")]
    NotFound { name: String, env: String },

    #[error("failed to read credential '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Cached credential lookup
#[derive(Debug, Default)]
pub struct Credentials {
    directory: Option<PathBuf>,
    cache: RwLock<HashMap<String, String>>,
}

impl Credentials {
    /// Look up credentials in `directory` before falling back to the environment
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            directory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Use `$CREDENTIALS_DIRECTORY` if set
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("CREDENTIALS_DIRECTORY").map(PathBuf::from))
    }

    /// Process-wide instance, created from the environment on first use
    pub fn global() -> &'static Credentials {
        static GLOBAL: OnceLock<Credentials> = OnceLock::new();
        GLOBAL.get_or_init(Credentials::from_env)
    }

    /// Look up a credential
    pub fn get(&self, name: &str) -> Result<String, CredentialError> {
        if let Some(value) = self.cache.read().get(name) {
            return Ok(value.clone());
        }

        let value = self.load(name)?;
        self.cache.write().insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Look up a credential that may legitimately be absent
    pub fn get_optional(&self, name: &str) -> Result<Option<String>, CredentialError> {
        match self.get(name) {
            Ok(value) => Ok(Some(value)),
            Err(CredentialError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Forget every cached value
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    fn load(&self, name: &str) -> Result<String, CredentialError> {
        if let Some(directory) = &self.directory {
            let path = directory.join(name);
            if path.is_file() {
                let value = std::fs::read_to_string(&path).map_err(|source| CredentialError::Io {
                    name: name.to_string(),
                    source,
                })?;
                debug!(credential = %name, "loaded credential from file");
                return Ok(value.trim().to_string());
            }
        }

        let env = name.to_uppercase();
        match std::env::var(&env) {
            Ok(value) => {
                debug!(credential = %name, "loaded credential from environment");
                Ok(value.trim().to_string())
            }
            Err(_) => Err(CredentialError::NotFound {
                name: name.to_string(),
                env,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_load_from_file_is_trimmed() {
        let dir = credentials_dir();
        std::fs::write(dir.path().join("api_key"), "  secret-value\n").unwrap();

        let creds = Credentials::new(Some(dir.path().to_path_buf()));
        assert_eq!(creds.get("api_key").unwrap(), "secret-value");
    }

    #[test]
    fn test_values_are_cached() {
        let dir = credentials_dir();
        let path = dir.path().join("token");
        std::fs::write(&path, "first").unwrap();

        let creds = Credentials::new(Some(dir.path().to_path_buf()));
        assert_eq!(creds.get("token").unwrap(), "first");

        std::fs::write(&path, "second").unwrap();
        assert_eq!(creds.get("token").unwrap(), "first");
        assert_eq!(creds.cache_len(), 1);

        creds.clear_cache();
        assert_eq!(creds.cache_len(), 0);
        assert_eq!(creds.get("token").unwrap(), "second");
    }

    #[test]
    fn test_file_takes_precedence_over_environment() {
        let dir = credentials_dir();
        std::fs::write(dir.path().join("hammond_test_precedence"), "from-file").unwrap();
        std::env::set_var("HAMMOND_TEST_PRECEDENCE", "from-env");

        let creds = Credentials::new(Some(dir.path().to_path_buf()));
        assert_eq!(creds.get("hammond_test_precedence").unwrap(), "from-file");

        std::env::remove_var("HAMMOND_TEST_PRECEDENCE");
    }

    #[test]
    fn test_falls_back_to_uppercase_environment() {
        std::env::set_var("HAMMOND_TEST_FALLBACK", "  from-env ");

        let creds = Credentials::new(Some(credentials_dir().path().to_path_buf()));
        assert_eq!(creds.get("hammond_test_fallback").unwrap(), "from-env");

        let without_dir = Credentials::new(None);
        assert_eq!(without_dir.get("hammond_test_fallback").unwrap(), "from-env");

        std::env::remove_var("HAMMOND_TEST_FALLBACK");
    }

    #[test]
    fn test_missing_credential() {
        let creds = Credentials::new(None);
        let err = creds.get("hammond_test_missing").unwrap_err();
        assert!(matches!(
            err,
            CredentialError::NotFound { ref env, .. } if env == "HAMMOND_TEST_MISSING"
        ));
        assert_eq!(creds.get_optional("hammond_test_missing").unwrap(), None);
        assert_eq!(creds.cache_len(), 0);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(Credentials::global(), Credentials::global()));
    }
}
