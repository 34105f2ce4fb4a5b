// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Parsing of the `OTEL_*` environment variables the agent reads on
//! startup (spec.md §6).

use std::{env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("OTEL_GO_AUTO_TARGET_EXE is not set")]
    MissingTarget,
    #[error("OTEL_GO_AUTO_TARGET_EXE must be an absolute path, got {0:?}")]
    TargetNotAbsolute(PathBuf),
    #[error("{0} is not a recognised sampler name")]
    InvalidSampler(String),
    #[error("OTEL_TRACES_SAMPLER_ARG {0:?} is not a valid floating point number")]
    SamplerArgUnparsable(String),
    #[error("OTEL_TRACES_SAMPLER_ARG {0} is out of range [0,1]")]
    SamplerArgOutOfRange(f64),
}

/// A ratio expressed as `numerator / 10^9`, matching spec.md §6's rule for
/// converting `traceidratio` into a rational the rest of the agent can
/// compare without floating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratio {
    numerator: u64,
}

const RATIO_DENOMINATOR: u64 = 1_000_000_000;

impl Ratio {
    pub fn from_fraction(fraction: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::SamplerArgOutOfRange(fraction));
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let numerator = (fraction * RATIO_DENOMINATOR as f64).round() as u64;
        Ok(Self { numerator })
    }

    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    pub fn denominator(&self) -> u64 {
        RATIO_DENOMINATOR
    }

    pub fn as_fraction(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let frac = self.numerator as f64 / RATIO_DENOMINATOR as f64;
        frac
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sampler {
    AlwaysOn,
    AlwaysOff,
    TraceIdRatio(Ratio),
    ParentBasedAlwaysOn,
    ParentBasedAlwaysOff,
    ParentBasedTraceIdRatio(Ratio),
}

impl Sampler {
    /// Parses `OTEL_TRACES_SAMPLER`/`OTEL_TRACES_SAMPLER_ARG` per spec.md
    /// §6. `arg` is only consulted for the two `traceidratio` variants.
    pub fn from_env_values(name: &str, arg: Option<&str>) -> Result<Self, ConfigError> {
        let ratio = |arg: Option<&str>| -> Result<Ratio, ConfigError> {
            let arg = arg.unwrap_or("1");
            let fraction: f64 = arg
                .trim()
                .parse()
                .map_err(|_| ConfigError::SamplerArgUnparsable(arg.to_string()))?;
            Ratio::from_fraction(fraction)
        };

        Ok(match name {
            "always_on" => Sampler::AlwaysOn,
            "always_off" => Sampler::AlwaysOff,
            "traceidratio" => Sampler::TraceIdRatio(ratio(arg)?),
            "parentbased_always_on" => Sampler::ParentBasedAlwaysOn,
            "parentbased_always_off" => Sampler::ParentBasedAlwaysOff,
            "parentbased_traceidratio" => Sampler::ParentBasedTraceIdRatio(ratio(arg)?),
            other => return Err(ConfigError::InvalidSampler(other.to_string())),
        })
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Sampler::ParentBasedAlwaysOn
    }
}

/// Resource attributes parsed from `OTEL_RESOURCE_ATTRIBUTES`
/// (`key1=value1,key2=value2`, percent-decoding is intentionally not
/// performed — the exporter collaborator owns that).
pub fn parse_resource_attributes(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Everything the agent reads from the environment at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub target_exe: PathBuf,
    pub service_name: Option<String>,
    pub resource_attributes: Vec<(String, String)>,
    pub show_verifier_log: bool,
    pub sampler: Sampler,
}

impl EnvConfig {
    pub fn from_environment() -> Result<Self, ConfigError> {
        let target_exe = env::var("OTEL_GO_AUTO_TARGET_EXE")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingTarget)
            .map(PathBuf::from)?;
        if !target_exe.is_absolute() {
            return Err(ConfigError::TargetNotAbsolute(target_exe));
        }

        let service_name = env::var("OTEL_SERVICE_NAME").ok();
        let resource_attributes = env::var("OTEL_RESOURCE_ATTRIBUTES")
            .ok()
            .map(|raw| parse_resource_attributes(&raw))
            .unwrap_or_default();
        let show_verifier_log = env::var("OTEL_GO_AUTO_SHOW_VERIFIER_LOG")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        let sampler_name =
            env::var("OTEL_TRACES_SAMPLER").unwrap_or_else(|_| "parentbased_always_on".into());
        let sampler_arg = env::var("OTEL_TRACES_SAMPLER_ARG").ok();
        let sampler = Sampler::from_env_values(&sampler_name, sampler_arg.as_deref())?;

        Ok(Self {
            target_exe,
            service_name,
            resource_attributes,
            show_verifier_log,
            sampler,
        })
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceidratio_numerator_matches_scenario_d() {
        let sampler = Sampler::from_env_values("parentbased_traceidratio", Some("0.1")).unwrap();
        match sampler {
            Sampler::ParentBasedTraceIdRatio(ratio) => {
                assert_eq!(ratio.numerator(), 100_000_000);
                assert_eq!(ratio.denominator(), 1_000_000_000);
            }
            other => panic!("expected ParentBasedTraceIdRatio, got {other:?}"),
        }
    }

    #[test]
    fn sampler_arg_out_of_range_is_an_error() {
        assert!(Sampler::from_env_values("traceidratio", Some("1.5")).is_err());
        assert!(Sampler::from_env_values("traceidratio", Some("-0.1")).is_err());
    }

    #[test]
    fn sampler_arg_unparsable_is_an_error() {
        assert!(Sampler::from_env_values("traceidratio", Some("not-a-number")).is_err());
    }

    #[test]
    fn unknown_sampler_name_is_an_error() {
        assert!(Sampler::from_env_values("bogus", None).is_err());
    }

    #[test]
    fn resource_attributes_parse_pairs() {
        let attrs = parse_resource_attributes("service.version=1.2.3,deployment.environment=prod");
        assert_eq!(
            attrs,
            vec![
                ("service.version".to_string(), "1.2.3".to_string()),
                ("deployment.environment".to_string(), "prod".to_string()),
            ]
        );
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }
}
