//! SQL identifier quoting per backend.
//!
//! `key` and `group` are reserved words in the supported backends, so every
//! statement that names them goes through [`Dialect::quote`].

use serde::Deserialize;

/// Relational backend flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    Mysql,
}

impl Dialect {
    /// Quote an identifier for this backend.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", ident),
            Dialect::Mysql => format!("`{}`", ident),
        }
    }
}
