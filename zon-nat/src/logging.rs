use log::LevelFilter;

/// Initializes the global logger. `RUST_LOG` applies when no level is
/// given on the command line.
pub fn init_log(level: Option<LevelFilter>) {
    let env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder.format_timestamp_millis();

    if let Err(e) = builder.try_init() {
        eprintln!("Logger already initialized, {}", e);
    }
}
