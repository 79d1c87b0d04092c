use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "FEEDSYNC_LOG";

fn main() {
    if handle_cli_flags() {
        return;
    }
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None | Some("demo") => feedsync::app::run_demo(),
        Some("feed") => feedsync::app::FeedArgs::parse(&args[1..]).and_then(feedsync::app::run_feed),
        Some(other) => Err(anyhow::anyhow!("unknown command: {other} (try --help)")),
    };

    if let Err(err) = result {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("feedsync {}", feedsync::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "feedsync - cached social feeds with optimistic mutations.\n\n\
                     Usage: feedsync [COMMAND]\n\n\
                     Commands:\n  \
                     demo                 Run against an in-memory backend (default)\n  \
                     feed [OPTIONS]       Load pages from the configured backend\n\n\
                     Feed options:\n  \
                     --sort <recent|oldest|likes>\n  \
                     --tag <TAG>\n  \
                     --viewer <USER_ID>\n  \
                     --pages <N>\n  \
                     --config <PATH>\n\n\
                     Flags:\n  \
                     --version, -V        Show version and exit\n  \
                     --help,    -h        Show this help message\n\n\
                     Set {LOG_ENV}=debug for verbose logs."
                );
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
