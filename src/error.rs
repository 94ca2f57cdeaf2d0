// src/error.rs

use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SvyError {
    #[error("Invalid design: {0}")]
    InvalidDesign(String),

    #[error("Empty design: {0}")]
    EmptyDesign(String),

    #[error("Degenerate design: {0}")]
    DesignDegeneracy(String),

    #[error("Invalid formula: {0}")]
    InvalidFormula(String),

    #[error("IRLS did not converge within {iterations} iterations")]
    Convergence { iterations: usize },

    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    #[error("Unknown term: {0}")]
    UnknownTerm(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

pub type Result<T> = std::result::Result<T, SvyError>;
