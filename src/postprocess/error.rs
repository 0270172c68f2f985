use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PostProcessorError {
    #[error("post processor '{0}' needs a parameter, ie. '{0}_160'")]
    MissingParameter(String),
    #[error("invalid parameter '{param}' for post processor '{name}'")]
    InvalidParameter { name: String, param: String },
}
