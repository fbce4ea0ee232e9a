use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerbosity {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

impl CliVerbosity {
    fn directive(self) -> &'static str {
        match self {
            CliVerbosity::Quiet => "error",
            CliVerbosity::Normal => "modsync=warn",
            CliVerbosity::Verbose => "modsync=info,warn",
            CliVerbosity::Debug => "modsync=debug,ureq=info,warn",
        }
    }
}

/// Logs go to stderr so `--format json` output stays clean. `RUST_LOG`
/// wins over the verbosity flags. Later calls are ignored.
pub fn init(verbosity: CliVerbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    let layer = fmt::layer()
        .compact()
        .with_target(matches!(verbosity, CliVerbosity::Debug))
        .with_thread_names(matches!(verbosity, CliVerbosity::Debug))
        .with_writer(std::io::stderr);
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}
