//! Runtime configuration.

use std::num::ParseIntError;

use crate::vertex::Fuel;

/// Default fuel budget per heartbeat (`dag_freq`).
pub const DEFAULT_DAG_FREQ: Fuel = 2048;

/// Tuning knobs of the scheduler.
///
/// * `dag_freq` (D) — fuel handed to each `run` call; larger means less
///   scheduling overhead and slower reaction to load imbalance.
/// * `sharing_freq` (K) — minimum frontier weight at which a steal request
///   is honored; larger keeps work with the producing worker.
/// * `nb_workers` — worker thread count.
/// * `never_promote` — debugging switch: fuel exhaustion always reschedules
///   instead of promoting. Expect extreme serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub nb_workers: usize,
    pub dag_freq: Fuel,
    pub sharing_freq: Fuel,
    pub never_promote: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            nb_workers: 1,
            dag_freq: DEFAULT_DAG_FREQ,
            sharing_freq: 2 * DEFAULT_DAG_FREQ,
            never_promote: false,
        }
    }
}

impl RuntimeOptions {
    pub fn with_nb_workers(mut self, nb_workers: usize) -> Self {
        self.nb_workers = nb_workers.max(1);
        self
    }

    pub fn with_dag_freq(mut self, dag_freq: Fuel) -> Self {
        self.dag_freq = dag_freq.max(1);
        self
    }

    pub fn with_sharing_freq(mut self, sharing_freq: Fuel) -> Self {
        self.sharing_freq = sharing_freq;
        self
    }

    pub fn with_never_promote(mut self, never_promote: bool) -> Self {
        self.never_promote = never_promote;
        self
    }
}

// PARSING
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("missing value for option `{key}`")]
    MissingValue { key: String },
    #[error("invalid value `{value}` for option `{key}`")]
    InvalidInteger {
        key: String,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid flag value `{value}` for option `{key}` (expected 0/1/true/false)")]
    InvalidFlag { key: String, value: String },
}

/// Parses scheduler knobs from `key value` argument pairs.
///
/// Recognized keys (with or without a leading dash): `dag_freq`,
/// `sharing_freq`, `proc`, `never_promote`. Unrecognized keys are ignored
/// so the runtime can share an argument vector with the client program.
pub fn initialize<I, S>(args: I) -> Result<RuntimeOptions, OptionsError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut options = RuntimeOptions::default();
    let mut sharing_set = false;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let key = arg.as_ref().trim_start_matches('-');
        if !matches!(key, "dag_freq" | "sharing_freq" | "proc" | "never_promote") {
            continue;
        }
        let value = match args.next() {
            Some(v) => v.as_ref().to_owned(),
            None => return Err(OptionsError::MissingValue { key: key.to_owned() }),
        };
        match key {
            "dag_freq" => options.dag_freq = parse_int(key, &value)?.max(1),
            "sharing_freq" => {
                options.sharing_freq = parse_int(key, &value)?;
                sharing_set = true;
            },
            "proc" => options.nb_workers = parse_int(key, &value)?.max(1),
            "never_promote" => {
                options.never_promote = match value.as_str() {
                    "1" | "true" => true,
                    "0" | "false" => false,
                    _ => {
                        return Err(OptionsError::InvalidFlag { key: key.to_owned(), value });
                    },
                }
            },
            _ => unreachable!(),
        }
    }
    if !sharing_set {
        options.sharing_freq = 2 * options.dag_freq;
    }
    Ok(options)
}

fn parse_int(key: &str, value: &str) -> Result<usize, OptionsError> {
    value.parse().map_err(|source| OptionsError::InvalidInteger {
        key: key.to_owned(),
        value: value.to_owned(),
        source,
    })
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let options = initialize::<_, &str>([]).unwrap();
        assert_eq!(options, RuntimeOptions::default());
    }

    #[test]
    fn knobs_parse_and_sharing_follows_dag_freq() {
        let options = initialize(["-dag_freq", "512", "proc", "4", "ignored", "x"]).unwrap();
        assert_eq!(options.dag_freq, 512);
        assert_eq!(options.sharing_freq, 1024);
        assert_eq!(options.nb_workers, 4);
        assert!(!options.never_promote);
    }

    #[test]
    fn explicit_sharing_freq_wins() {
        let options = initialize(["dag_freq", "512", "sharing_freq", "9000"]).unwrap();
        assert_eq!(options.sharing_freq, 9000);
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(matches!(
            initialize(["dag_freq", "many"]),
            Err(OptionsError::InvalidInteger { .. })
        ));
        assert!(matches!(
            initialize(["never_promote", "maybe"]),
            Err(OptionsError::InvalidFlag { .. })
        ));
        assert!(matches!(initialize(["proc"]), Err(OptionsError::MissingValue { .. })));
    }
}
