//! Token authentication. The token database is a JSON5 file:
//!
//! ```json5
//! {
//!     tokens: [
//!         { token: "abc123", name: "maintainer", date: "2025-01-01", superuser: true },
//!     ],
//! }
//! ```
//!
//! Authorization elsewhere is token-owner equality; `superuser` bypasses it.

use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::json;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub superuser: bool,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    #[serde(flatten)]
    info: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenDb {
    #[serde(default)]
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Default)]
pub struct TokenAuth {
    tokens: HashMap<String, TokenInfo>,
}

impl TokenAuth {
    /// Loads the token database. A missing file is created empty so the
    /// operator has something to edit.
    pub fn load(path: &Path) -> anyhow::Result<TokenAuth> {
        let contents = match fs_err::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs_err::create_dir_all(parent)?;
                }
                fs_err::write(path, "{\n    tokens: [],\n}\n")?;
                return Ok(TokenAuth::default());
            }
            Err(e) => return Err(e.into()),
        };

        let db: TokenDb = json::from_slice_with_context(&contents, || path.display().to_string())?;

        let tokens = db
            .tokens
            .into_iter()
            .map(|entry| (entry.token, entry.info))
            .collect();

        Ok(TokenAuth { tokens })
    }

    pub fn lookup(&self, token: &str) -> Option<&TokenInfo> {
        self.tokens.get(token)
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    pub fn is_superuser(&self, token: &str) -> bool {
        self.tokens.get(token).is_some_and(|info| info.superuser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json5");
        std::fs::write(
            &path,
            r#"{
                tokens: [
                    { token: "alpha", name: "a", date: "2025-01-01" },
                    { token: "root", name: "admin", superuser: true },
                ],
            }"#,
        )
        .unwrap();

        let auth = TokenAuth::load(&path).unwrap();
        assert!(auth.is_valid("alpha"));
        assert!(!auth.is_superuser("alpha"));
        assert!(auth.is_superuser("root"));
        assert!(!auth.is_valid("missing"));
        assert_eq!(auth.lookup("alpha").unwrap().name, "a");
    }

    #[test]
    fn missing_db_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("tokens.json5");

        let auth = TokenAuth::load(&path).unwrap();
        assert!(!auth.is_valid("anything"));
        assert!(path.exists(), "empty token db should be created");

        // And the created file loads cleanly next time.
        let auth = TokenAuth::load(&path).unwrap();
        assert!(!auth.is_valid("anything"));
    }

    #[test]
    fn malformed_db_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json5");
        std::fs::write(&path, "{ tokens: [ { nope: 1 } ] }").unwrap();
        assert!(TokenAuth::load(&path).is_err());
    }
}
