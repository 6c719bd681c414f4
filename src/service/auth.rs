use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha1::{Digest as _, Sha1};
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;

const APR1_MAGIC: &str = "$apr1$";
const CRYPT_ALPHABET: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Credential check consumed by the auth middleware.
pub trait Authenticator: Send + Sync {
    fn matches(&self, username: &str, password: &str) -> bool;
}

#[derive(Debug, Clone)]
enum Secret {
    Bcrypt(String),
    Apr1 { salt: String, hash: String },
    Sha1(Vec<u8>),
}

/// Users loaded from an htpasswd file. Bcrypt (`$2a$`, `$2b$`, `$2y$`),
/// Apache MD5 (`$apr1$`, what `htpasswd` writes by default) and `{SHA}`
/// entries are understood; other formats are skipped at load time.
#[derive(Debug, Clone, Default)]
pub struct HtpasswdFile {
    users: HashMap<String, Secret>,
}

impl HtpasswdFile {
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let file = Self::parse(&contents);
        tracing::info!("loaded {} user(s) from {}", file.users.len(), path.display());
        Ok(file)
    }

    pub fn parse(contents: &str) -> Self {
        let mut users = HashMap::new();
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, hash)) = line.split_once(':') else {
                tracing::warn!(line = number + 1, "skipping htpasswd line without a separator");
                continue;
            };
            let secret = if ["$2a$", "$2b$", "$2y$"].iter().any(|p| hash.starts_with(p)) {
                Secret::Bcrypt(hash.to_string())
            } else if let Some(rest) = hash.strip_prefix(APR1_MAGIC) {
                match rest.split_once('$') {
                    Some((salt, _)) if !salt.is_empty() => Secret::Apr1 {
                        salt: salt.to_string(),
                        hash: hash.to_string(),
                    },
                    _ => {
                        tracing::warn!(user, "skipping malformed $apr1$ entry");
                        continue;
                    }
                }
            } else if let Some(encoded) = hash.strip_prefix("{SHA}") {
                match STANDARD.decode(encoded) {
                    Ok(raw) => Secret::Sha1(raw),
                    Err(e) => {
                        tracing::warn!(user, "skipping malformed {{SHA}} entry: {e}");
                        continue;
                    }
                }
            } else {
                tracing::warn!(user, "skipping entry with unsupported hash format");
                continue;
            };
            users.insert(user.to_string(), secret);
        }
        HtpasswdFile { users }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for HtpasswdFile {
    fn matches(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(Secret::Bcrypt(hash)) => bcrypt::verify(password, hash).unwrap_or(false),
            Some(Secret::Apr1 { salt, hash }) => {
                apr1_crypt(password.as_bytes(), salt.as_bytes())
                    .as_bytes()
                    .ct_eq(hash.as_bytes())
                    .into()
            }
            Some(Secret::Sha1(expected)) => Sha1::digest(password.as_bytes())
                .as_slice()
                .ct_eq(expected.as_slice())
                .into(),
            None => false,
        }
    }
}

/// Apache's MD5-crypt variant: `$apr1$<salt>$<22 chars>`, salt cut to 8
/// bytes, 1000 strengthening rounds.
fn apr1_crypt(password: &[u8], salt: &[u8]) -> String {
    let salt = &salt[..salt.len().min(8)];
    let alternate = Md5::new()
        .chain_update(password)
        .chain_update(salt)
        .chain_update(password)
        .finalize();

    let mut ctx = Md5::new();
    ctx.update(password);
    ctx.update(APR1_MAGIC.as_bytes());
    ctx.update(salt);
    for chunk in password.chunks(16) {
        ctx.update(&alternate[..chunk.len()]);
    }
    let mut bits = password.len();
    while bits > 0 {
        if bits & 1 == 1 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        bits >>= 1;
    }
    let mut digest = ctx.finalize();

    for round in 0..1000 {
        let mut ctx = Md5::new();
        if round & 1 == 1 {
            ctx.update(password);
        } else {
            ctx.update(&digest[..]);
        }
        if round % 3 != 0 {
            ctx.update(salt);
        }
        if round % 7 != 0 {
            ctx.update(password);
        }
        if round & 1 == 1 {
            ctx.update(&digest[..]);
        } else {
            ctx.update(password);
        }
        digest = ctx.finalize();
    }

    let mut encoded = String::with_capacity(22);
    let mut push = |mut value: u32, chars: usize| {
        for _ in 0..chars {
            encoded.push(CRYPT_ALPHABET[(value & 0x3f) as usize] as char);
            value >>= 6;
        }
    };
    for (a, b, c) in [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        push(
            u32::from(digest[a]) << 16 | u32::from(digest[b]) << 8 | u32::from(digest[c]),
            4,
        );
    }
    push(u32::from(digest[11]), 2);

    format!("{APR1_MAGIC}{}${encoded}", String::from_utf8_lossy(salt))
}
