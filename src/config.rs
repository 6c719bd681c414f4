use serde::Serialize;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    /// External base URL, e.g. `https://registry.example.com`.
    pub registry_url: String,
    pub root_dir: PathBuf,
    pub database_file: PathBuf,
    pub htpasswd_file: Option<PathBuf>,
    pub realm: String,
    pub upload_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_tag_page: usize,
}

impl RegistryConfig {
    /// A configuration rooted at `dir` with the defaults used by the CLI.
    pub fn with_root(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        RegistryConfig {
            host: "127.0.0.1".to_string(),
            port: 8968,
            registry_url: "http://127.0.0.1:8968".to_string(),
            root_dir: dir.join("storage"),
            database_file: dir.join("registry.db"),
            htpasswd_file: None,
            realm: "Registry".to_string(),
            upload_idle_timeout_secs: 3600,
            sweep_interval_secs: 60,
            request_timeout_secs: 120,
            max_tag_page: 1000,
        }
    }

    fn base_url(&self) -> &str {
        self.registry_url.trim_end_matches('/')
    }

    /// Scheme and authority of `registry_url`, used as the CORS origin.
    pub fn origin(&self) -> &str {
        let base = self.base_url();
        let authority_start = base.find("://").map(|i| i + 3).unwrap_or(0);
        match base[authority_start..].find('/') {
            Some(path_start) => &base[..authority_start + path_start],
            None => base,
        }
    }

    pub fn manifest_url(&self, name: &str, reference: &str) -> String {
        format!("{}/v2/{name}/manifests/{reference}", self.base_url())
    }

    pub fn tag_list_url(&self, name: &str, n: usize, last: &str) -> String {
        format!("{}/v2/{name}/tags/list?n={n}&last={last}", self.base_url())
    }
}
