//! Shared plumbing for the demo binaries.

use pulse_runtime::RuntimeOptions;

/// Installs the tracing subscriber (honoring `RUST_LOG`-style filtering via
/// `PULSE_LOG`) and parses scheduler options from the process arguments.
///
/// Returns the options plus the raw argument vector so demos can pull their
/// own knobs (`n`, etc.) out of the same `key value` pairs.
pub fn bootstrap() -> (RuntimeOptions, Vec<String>) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("PULSE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match pulse_runtime::initialize(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("bad scheduler option: {err}");
            std::process::exit(2);
        },
    };
    (options, args)
}

/// Fetches an integer argument given as `key value`.
pub fn arg_or<T: std::str::FromStr>(args: &[String], key: &str, default: T) -> T {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a.trim_start_matches('-') == key {
            if let Some(v) = it.next()
                && let Ok(parsed) = v.parse()
            {
                return parsed;
            }
            eprintln!("ignoring malformed value for {key}");
        }
    }
    default
}
