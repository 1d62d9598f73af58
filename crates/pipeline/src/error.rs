//! Error taxonomy for the orchestrator crate.

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to parse pipeline configuration: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
