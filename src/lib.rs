// src/lib.rs

//! Design-based estimation and quasi-Poisson regression for complex survey
//! data.
//!
//! A [`SurveyDesign`] binds a rectangular dataset (a polars `DataFrame`) to
//! its sampling weight, PSU (cluster), and stratum columns. From a design:
//!
//! - [`weighted_mean`] computes weighted means with Taylor-linearized,
//!   cluster/stratum-aware standard errors, optionally grouped;
//! - [`fit_quasipoisson`] fits a log-link quasi-Poisson model with survey
//!   weights and a design-based (sandwich) coefficient covariance;
//! - [`predict`] projects a fitted model onto a covariate grid with
//!   delta-method intervals on the response scale.
//!
//! Designs, fitted models, and result tables are immutable values, so
//! independent model specifications can be estimated in any order or in
//! parallel ([`fit_many`]).

pub mod design;
pub mod error;
pub mod estimation;
pub mod inference;
pub mod prediction;
pub mod regression;

pub use design::{NaPolicy, SingletonPolicy, SurveyDesign};
pub use error::{Result, SvyError};
pub use estimation::{weighted_mean, MeanOptions};
pub use prediction::{predict, PredictOptions};
pub use regression::{fit_many, fit_quasipoisson, FittedModel, Formula, GlmOptions, Term};
