//! `DeployEnv` and environment variable helpers.

use std::env;
use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_with::DeserializeFromStr;

/// Represents a validated `DEPLOY_ENVIRONMENT` configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[derive(Serialize, DeserializeFromStr)]
pub enum DeployEnv {
    /// "dev"
    Dev,
    /// "staging"
    Staging,
    /// "prod"
    Prod,
}

impl DeployEnv {
    /// Read a [`DeployEnv`] from env, defaulting to dev if unset.
    pub fn from_env() -> anyhow::Result<Self> {
        match env::var("DEPLOY_ENVIRONMENT") {
            Ok(value) => Self::from_str(&value),
            Err(env::VarError::NotPresent) => Ok(Self::Dev),
            Err(err) => Err(err).context("DEPLOY_ENVIRONMENT was not unicode"),
        }
    }

    #[inline]
    pub fn is_dev(self) -> bool {
        matches!(self, Self::Dev)
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

impl FromStr for DeployEnv {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            _ => Err(anyhow!(
                "DEPLOY_ENVIRONMENT must be 'dev', 'staging', or 'prod'"
            )),
        }
    }
}

impl Display for DeployEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read a required env var.
pub fn required(name: &'static str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} was not set"))
}

/// Read an optional env var. `None` if unset; an error if not unicode.
pub fn optional(name: &'static str) -> anyhow::Result<Option<String>> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("{name} was not unicode")),
    }
}

/// Read and parse an optional env var, falling back to `default` if unset.
pub fn parsed_or<T>(name: &'static str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name)? {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("{name} could not be parsed")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deploy_env_roundtrip() {
        for env in [DeployEnv::Dev, DeployEnv::Staging, DeployEnv::Prod] {
            assert_eq!(DeployEnv::from_str(env.as_str()).unwrap(), env);
        }
        assert!(DeployEnv::from_str("production").is_err());
    }
}
