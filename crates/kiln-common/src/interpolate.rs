//! Build-environment interpolation.
//!
//! Build-time environment values may reference the invoking process's
//! environment with `{{ env:NAME }}`. References are resolved before the
//! values reach the assemble engine; an unresolvable reference aborts the
//! build.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*env:([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

/// A single name/value environment assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value, possibly containing `{{ env:NAME }}` references.
    pub value: String,
}

impl EnvVar {
    /// Create an assignment.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Resolve `{{ env:NAME }}` references in every value against the process
/// environment.
pub fn interpolate(vars: &[EnvVar]) -> KilnResult<Vec<EnvVar>> {
    vars.iter()
        .map(|var| {
            let mut missing = None;
            let value = ENV_REF.replace_all(&var.value, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match std::env::var(name) {
                    Ok(v) => v,
                    Err(_) => {
                        missing.get_or_insert_with(|| name.to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                return Err(KilnError::Config {
                    message: format!(
                        "cannot interpolate {}: environment variable {} is not set",
                        var.name, name
                    ),
                });
            }
            Ok(EnvVar::new(var.name.clone(), value.into_owned()))
        })
        .collect()
}
