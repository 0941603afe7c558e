/// Why a model could not be loaded. Cloneable so that every caller waiting
/// on one shared fetch receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("failed to fetch '{url}': {message}")]
    Fetch { url: String, message: String },

    #[error("failed to parse '{url}': {message}")]
    Parse { url: String, message: String },

    #[error(
        "'{url}' requires Draco mesh compression, but no decoder is available at '{decoder_path}'"
    )]
    UnsupportedCompression { url: String, decoder_path: String },

    #[error("'{url}' contains no meshes to display")]
    EmptyScene { url: String },
}

impl LoadError {
    pub fn url(&self) -> &str {
        match self {
            LoadError::Fetch { url, .. }
            | LoadError::Parse { url, .. }
            | LoadError::UnsupportedCompression { url, .. }
            | LoadError::EmptyScene { url } => url,
        }
    }

    pub fn fetch(url: &str, err: impl std::fmt::Display) -> Self {
        LoadError::Fetch {
            url: url.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub fn parse(url: &str, err: impl std::fmt::Display) -> Self {
        LoadError::Parse {
            url: url.to_string(),
            message: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_url() {
        let err = LoadError::fetch("/models/plant.glb", "404 Not Found");
        assert_eq!(err.url(), "/models/plant.glb");
        assert_eq!(
            err.to_string(),
            "failed to fetch '/models/plant.glb': 404 Not Found"
        );
    }

    #[test]
    fn fetch_keeps_anyhow_context_chain() {
        let source = anyhow::anyhow!("no such file").context("reading res/models/x.glb");
        let err = LoadError::fetch("/models/x.glb", source);
        assert!(err.to_string().contains("reading res/models/x.glb: no such file"));
    }
}
