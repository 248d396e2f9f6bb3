//! Method for ingesting files into the store: flat (hash the raw bytes) or
//! recursive (hash an archive serialisation of a whole directory tree).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FileIngestionMethod {
    /// A single file's contents are hashed as-is.
    Flat,
    /// A directory tree is canonicalised and its serialisation is hashed.
    Recursive,
}

impl FileIngestionMethod {
    pub fn is_recursive(self) -> bool {
        matches!(self, Self::Recursive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Recursive => "recursive",
        }
    }
}

impl fmt::Display for FileIngestionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileIngestionMethod {
    type Err = InvalidFileIngestionMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Self::Flat),
            "recursive" => Ok(Self::Recursive),
            _ => Err(InvalidFileIngestionMethod(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid file ingestion method: {0:?}")]
pub struct InvalidFileIngestionMethod(pub String);
