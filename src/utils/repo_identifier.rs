use crate::error::AppError;
use crate::utils::validation::is_valid_name;
use std::fmt;

/// A repository addressed as `name` or `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RepoIdentifier {
    pub namespace: Option<String>,
    pub name: String,
}

impl RepoIdentifier {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> RepoIdentifier {
        RepoIdentifier {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Parses the `{name}` part of a `/v2/{name}/...` path. The first segment
    /// is the namespace when more than one segment is present.
    pub fn parse(full_name: impl AsRef<str>) -> Result<RepoIdentifier, AppError> {
        let full_name = full_name.as_ref();
        if !is_valid_name(full_name) {
            return Err(AppError::NameInvalid(full_name.to_string()));
        }
        Ok(full_name
            .split_once('/')
            .map(|(namespace, name)| RepoIdentifier::new(Some(namespace), name))
            .unwrap_or_else(|| RepoIdentifier::new(None, full_name)))
    }

    /// Column value for the namespace; the database stores "no namespace" as
    /// an empty string so the unique key is total.
    pub fn namespace_key(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for RepoIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}
