#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorePath {
    path: String,
}

impl StorePath {
    #[must_use]
    pub fn new(p: &str) -> Self {
        Self {
            path: p.to_string(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Final path component, e.g. `a.drv` for `/build/store/a.drv`.
    #[must_use]
    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    #[must_use]
    pub fn is_drv(&self) -> bool {
        std::path::Path::new(&self.path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("drv"))
    }
}

impl serde::Serialize for StorePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.path)
    }
}
