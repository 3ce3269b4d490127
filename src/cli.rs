use clap::{value_parser, Arg, ArgAction, Command};

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub log_level: Option<String>,
    pub version: bool,
    pub path: String,
    pub weight: u32,
    pub repeat: u32,
    pub signed: bool,
}

pub fn build_cli() -> Command {
    Command::new("weightgate")
        .about("Run weight-checked queries against a rate-limited API")
        .disable_version_flag(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("path")
                .long("path")
                .num_args(1)
                .default_value("/api/v3/ping")
                .help("Endpoint to query"),
        )
        .arg(
            Arg::new("weight")
                .long("weight")
                .num_args(1)
                .value_parser(value_parser!(u32))
                .default_value("1")
                .help("Request weight declared for each query"),
        )
        .arg(
            Arg::new("repeat")
                .long("repeat")
                .num_args(1)
                .value_parser(value_parser!(u32).range(1..))
                .default_value("1")
                .help("Number of queries to run"),
        )
        .arg(
            Arg::new("signed")
                .long("signed")
                .help("Mark the query as requiring the API key")
                .action(ArgAction::SetTrue),
        )
}

pub fn parse_options(cmd: Command) -> CliOptions {
    let matches = cmd.get_matches();
    CliOptions {
        log_level: matches.get_one::<String>("log-level").cloned(),
        version: matches.get_flag("version"),
        path: matches
            .get_one::<String>("path")
            .cloned()
            .unwrap_or_else(|| "/api/v3/ping".to_string()),
        weight: matches.get_one::<u32>("weight").copied().unwrap_or(1),
        repeat: matches.get_one::<u32>("repeat").copied().unwrap_or(1),
        signed: matches.get_flag("signed"),
    }
}

pub fn init_logging(level: Option<&str>) {
    // Respect explicit level, else default to info, allow env override via RUST_LOG
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(lvl) = level {
        builder.parse_filters(lvl);
    }
    builder.target(env_logger::Target::Stderr).init();
}
