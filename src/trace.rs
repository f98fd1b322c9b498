use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Crates of this workspace, a bare level applies to all of them.
const TARGETS: [&str; 4] = ["squirrel", "consul", "tripwire", "backoff"];

/// Expand a bare level like `debug` into per crate directives, anything else
/// is passed to `EnvFilter` untouched.
pub fn directives(levels: &str) -> String {
    match levels {
        "off" => "off".to_string(),
        "trace" | "debug" | "info" | "warn" | "error" => TARGETS
            .iter()
            .map(|target| format!("{target}={levels}"))
            .collect::<Vec<_>>()
            .join(","),
        _ => levels.to_string(),
    }
}

pub fn init(color: bool, levels: &str) {
    let filter = EnvFilter::try_new(directives(levels)).unwrap_or_else(|err| {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("invalid log level {levels:?}, {err}, fallback to info");
        }

        EnvFilter::new(directives("info"))
    });

    // unwrap cannot be handled here, tests might init it more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_target(false)
        .finish()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_levels() {
        assert_eq!(
            directives("debug"),
            "squirrel=debug,consul=debug,tripwire=debug,backoff=debug"
        );
        assert_eq!(directives("off"), "off");
        assert_eq!(
            directives("squirrel=trace,hyper=info"),
            "squirrel=trace,hyper=info"
        );
    }
}
