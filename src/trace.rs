use tracing_subscriber::{FmtSubscriber, util::SubscriberInitExt};

/// Installs the global subscriber. Logs go to stderr so that stdout only
/// carries command output.
pub fn init(color: bool, json: bool, levels: &str) {
    // Ignore errors when setting, since tests can initialize this
    // multiple times.
    let _ = if json {
        FmtSubscriber::builder()
            .with_env_filter(levels)
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .finish()
            .try_init()
    } else {
        FmtSubscriber::builder()
            .with_ansi(color)
            .with_env_filter(levels)
            .with_writer(std::io::stderr)
            .finish()
            .try_init()
    };
}

/// The filter directive for `level`, covering this crate and its libs.
pub fn directives(level: &str) -> String {
    match level {
        "off" => "off".to_owned(),
        level => [
            format!("testpods={}", level),
            format!("portpicker={}", level),
            "kube=warn".to_owned(),
        ]
        .join(","),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_per_level() {
        assert_eq!(directives("off"), "off");
        assert_eq!(
            directives("debug"),
            "testpods=debug,portpicker=debug,kube=warn"
        );
    }

    #[test]
    fn init_twice() {
        init(false, false, &directives("info"));
        init(false, true, &directives("debug"));
        info!(message = "Still logging.");
    }
}
