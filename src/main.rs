use clap::{Arg, Command};
use log::LevelFilter;
use mailcheck::config::Config;
use mailcheck::email::ParsedEmail;
use mailcheck::service::Services;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("mailcheck")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Checks forwarded emails for spoofing, malicious links and scams")
        .long_about(
            "mailcheck watches a mail drop directory for messages forwarded by users,\n\
             verifies the sender, crawls every link in a headless browser, asks a\n\
             language model for a verdict and mails a trust report back.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mailcheck.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Analyze one .eml file and print the report as JSON")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("no-headers")
                .long("no-headers")
                .help("With --test-email: treat the file as a forwarded body without original headers")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/mailcheck.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Testing configuration {config_path}...");
        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid.");
                println!("  Mail server: {}", config.mail_server);
                println!("  Mail drop: {}", config.maildir.base_path);
                println!("  Daily limit: {}", config.rate_limit.daily_limit);
                println!("  Crawler concurrency: {}", config.crawler.max_concurrency);
                return;
            }
            Err(e) => {
                eprintln!("Configuration is invalid: {e}");
                process::exit(1);
            }
        }
    }

    if let Err(e) = config.validate() {
        eprintln!("Configuration is invalid: {e}");
        process::exit(1);
    }

    let services = match Services::build(config).await {
        Ok(services) => services,
        Err(e) => {
            eprintln!("Failed to start: {e:#}");
            process::exit(1);
        }
    };

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        let result = test_email_file(&services, email_file, !matches.get_flag("no-headers")).await;
        services.shutdown().await;
        if let Err(e) = result {
            eprintln!("Error analyzing {email_file}: {e:#}");
            process::exit(1);
        }
        return;
    }

    if let Err(e) = run(services).await {
        eprintln!("Fatal: {e:#}");
        process::exit(1);
    }
}

async fn run(services: Services) -> anyhow::Result<()> {
    let background = services.spawn_background();
    let watcher = Arc::new(services.maildir_watcher());
    let handle = watcher.start().await?;

    log::info!(
        "mailcheck {} watching {} (relay {})",
        env!("CARGO_PKG_VERSION"),
        services.config.maildir.base_path,
        services.config.mail_server
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Received shutdown signal, cleaning up...");

    drop(handle);
    for task in background {
        task.abort();
    }
    services.shutdown().await;
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        let mut config = Config::default();
        config.apply_env();
        Ok(config)
    }
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

async fn test_email_file(services: &Services, path: &str, full_headers: bool) -> anyhow::Result<()> {
    let raw = tokio::fs::read(path).await?;
    let email = ParsedEmail::parse(&raw)?;
    log::info!("Analyzing '{}' from {}", email.subject(), email.sender_address());

    let report = services
        .orchestrator
        .run_pipeline(&email, full_headers)
        .await
        .into_report(&email);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
