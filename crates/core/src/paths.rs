use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".pagevault"))
            .unwrap_or_else(|| PathBuf::from(".pagevault"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn store_db(&self) -> PathBuf {
        self.data_dir().join("artifacts.db")
    }

    /// Directory holding the captured artifact payloads (the database stores
    /// paths into this tree, never the bytes themselves).
    pub fn artifacts_dir(&self) -> PathBuf {
        self.base.join("artifacts")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
