use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "testpods", version, about, rename_all = "kebab-case")]
pub struct Opts {
    #[command(flatten)]
    pub root: RootOpts,

    #[command(subcommand)]
    pub sub_command: SubCommand,
}

impl Opts {
    pub fn get_matches() -> Result<Self, clap::Error> {
        Self::try_parse()
    }

    /// `validate` is one step quieter than `up` for the same flags.
    pub const fn log_level(&self) -> &'static str {
        let (quiet_level, verbose_level) = match self.sub_command {
            SubCommand::Validate(_) => {
                if self.root.verbose == 0 {
                    (self.root.quiet.saturating_add(1), self.root.verbose)
                } else {
                    (self.root.quiet, self.root.verbose - 1)
                }
            }
            SubCommand::Up(_) => (self.root.quiet, self.root.verbose),
        };
        match quiet_level {
            0 => match verbose_level {
                0 => "info",
                1 => "debug",
                2..=255 => "trace",
            },
            1 => "warn",
            2 => "error",
            3..=255 => "off",
        }
    }
}

#[derive(Args, Debug)]
pub struct RootOpts {
    /// Enable more detailed internal logging. Repeat to increase level. Overridden by `--quiet`.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce detail of internal logging. Repeat to reduce further. Overrides `--verbose`.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Set the logging format.
    #[arg(long, default_value = "text", env = "TESTPODS_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    /// Control when ANSI terminal formatting is used.
    ///
    /// `auto` enables it when stderr is a terminal.
    #[arg(long, default_value = "auto", env = "TESTPODS_COLOR", global = true)]
    pub color: Color,
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    /// Start the configured resources, print their endpoints and keep them
    /// running until interrupted.
    Up(UpOpts),

    /// Validate the target config, then exit.
    Validate(ValidateOpts),
}

#[derive(Args, Debug)]
pub struct UpOpts {
    /// Config file. The format is detected from the extension.
    #[arg(short, long, env = "TESTPODS_CONFIG")]
    pub config: PathBuf,

    /// Only start the named resource. May be repeated.
    #[arg(short, long = "resource", value_name = "NAME")]
    pub resources: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ValidateOpts {
    /// Config file. The format is detected from the extension.
    #[arg(short, long, env = "TESTPODS_CONFIG")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Color {
    Auto,
    Always,
    Never,
}

impl Color {
    pub fn use_color(self) -> bool {
        match self {
            Color::Auto => {
                use std::io::IsTerminal;
                std::io::stderr().is_terminal()
            }
            Color::Always => true,
            Color::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

pub fn handle_config_errors(error: &config::Error) -> exitcode::ExitCode {
    match error {
        config::Error::Invalid { errors } => {
            for error in errors {
                error!(message = "Configuration error.", %error);
            }
        }
        error => error!(message = "Configuration error.", %error),
    }

    exitcode::CONFIG
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::try_parse_from(std::iter::once("testpods").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_is_well_formed() {
        Opts::command().debug_assert();
    }

    #[test]
    fn up_with_resources() {
        let opts = parse(&["up", "--config", "deps.toml", "-r", "db", "--resource", "cache"]);
        match opts.sub_command {
            SubCommand::Up(up) => {
                assert_eq!(up.config, PathBuf::from("deps.toml"));
                assert_eq!(up.resources, vec!["db".to_owned(), "cache".to_owned()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(opts.root.log_format, LogFormat::Text);
        assert_eq!(opts.root.color, Color::Auto);
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse(&["up", "-c", "a.toml"]).log_level(), "info");
        assert_eq!(parse(&["-v", "up", "-c", "a.toml"]).log_level(), "debug");
        assert_eq!(parse(&["up", "-c", "a.toml", "-vvv"]).log_level(), "trace");
        assert_eq!(parse(&["up", "-c", "a.toml", "-qq"]).log_level(), "error");
        assert_eq!(parse(&["up", "-c", "a.toml", "-qqq"]).log_level(), "off");
        assert_eq!(parse(&["validate", "-c", "a.toml"]).log_level(), "warn");
        assert_eq!(parse(&["validate", "-c", "a.toml", "-v"]).log_level(), "info");
    }

    #[test]
    fn format_and_color() {
        let opts = parse(&["validate", "-c", "a.toml", "--log-format", "json", "--color", "never"]);
        assert_eq!(opts.root.log_format, LogFormat::Json);
        assert!(!opts.root.color.use_color());
        assert!(Color::Always.use_color());
    }

    #[test]
    fn config_is_required() {
        assert!(Opts::try_parse_from(["testpods", "up"]).is_err());
    }
}
