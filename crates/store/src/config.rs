use camino::Utf8PathBuf;

#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    pub path: Utf8PathBuf,
}

impl StoreConfig {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}
