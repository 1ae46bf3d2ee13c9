use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use mail_sentinel::classifier::ClassifierSnapshot;
use mail_sentinel::dns::HickoryLookup;
use mail_sentinel::rules::RuleEngine;
use mail_sentinel::{
    AdaptiveClassifier, Config, Coordinator, InboundMessage, MessageContext, SpfEvaluator,
};
use std::path::Path;
use std::process;
use std::sync::Arc;

const DNS_TIMEOUT_SECONDS: u64 = 5;

#[tokio::main]
async fn main() {
    let matches = Command::new("mail-sentinel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Concurrent email security analysis with SPF, Bayesian and rule-based scoring")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mail-sentinel.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and rule file, then exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("analyze")
                .long("analyze")
                .value_name("FILE")
                .help("Analyze a raw message and print the JSON report")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("client-ip")
                .long("client-ip")
                .value_name("IP")
                .help("Connecting client address for --analyze")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("helo")
                .long("helo")
                .value_name("NAME")
                .help("HELO/EHLO name for --analyze")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("train-spam")
                .long("train-spam")
                .value_name("FILE")
                .help("Train the classifier with a spam message (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("train-ham")
                .long("train-ham")
                .value_name("FILE")
                .help("Train the classifier with a legitimate message (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("untrain-spam")
                .long("untrain-spam")
                .value_name("FILE")
                .help("Reverse an earlier spam training (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("untrain-ham")
                .long("untrain-ham")
                .value_name("FILE")
                .help("Reverse an earlier ham training (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("classifier-state")
                .long("classifier-state")
                .value_name("FILE")
                .help("JSON classifier snapshot, loaded before and saved after training")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("verify-spf")
                .long("verify-spf")
                .value_names(["IP", "DOMAIN", "SENDER"])
                .num_args(3)
                .help("Run a single SPF verification and print the result")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/mail-sentinel.yaml");
    let config_exists = Path::new(config_path).exists();
    let config = if config_exists {
        match Config::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {e:#}");
                process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.logging.level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !config_exists {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        if let Err(e) = test_config(&config) {
            eprintln!("Configuration validation failed: {e:#}");
            process::exit(1);
        }
        return;
    }

    if let Some(values) = matches.get_many::<String>("verify-spf") {
        let args: Vec<&String> = values.collect();
        if let Err(e) = verify_spf(&config, args[0], args[1], args[2]).await {
            eprintln!("SPF verification failed: {e:#}");
            process::exit(1);
        }
        return;
    }

    let wants_training = ["train-spam", "train-ham", "untrain-spam", "untrain-ham"]
        .iter()
        .any(|flag| matches.contains_id(flag));
    let analyze_file = matches.get_one::<String>("analyze");

    if !wants_training && analyze_file.is_none() {
        eprintln!("Nothing to do. Try --analyze FILE, --train-spam FILE or --help.");
        process::exit(2);
    }

    if let Err(e) = run(&config, &matches, wants_training, analyze_file).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!("Analysis timeout: {}ms", config.analysis.timeout_ms);
    println!("Failure policy: {:?}", config.analysis.failure_policy);
    println!(
        "SPF limits: {} lookups, {} void lookups",
        config.spf.max_lookups, config.spf.max_void_lookups
    );
    println!("Blacklist zones: {}", config.blacklist.zones.join(", "));
    match &config.reputation.endpoint {
        Some(endpoint) => println!("Reputation endpoint: {endpoint}"),
        None => println!("Reputation lookups: not configured"),
    }

    if let Some(path) = &config.rules_file {
        let mut engine = RuleEngine::new();
        let count = engine.load_rules(path)?;
        println!("Number of rules: {count}");
        for (i, rule) in engine.rules().iter().enumerate() {
            let state = if rule.enabled { "" } else { " (disabled)" };
            println!(
                "  Rule {}: {} [priority {}]{state}",
                i + 1,
                rule.name,
                rule.priority
            );
        }
    } else {
        println!("No rules file configured");
    }
    println!("Configuration is valid.");
    Ok(())
}

async fn verify_spf(config: &Config, ip: &str, domain: &str, sender: &str) -> anyhow::Result<()> {
    let dns = HickoryLookup::from_system_conf(DNS_TIMEOUT_SECONDS)?;
    let evaluator = SpfEvaluator::new(Arc::new(dns), config.spf.clone());
    let verification = evaluator.verify(ip, domain, sender, None).await;
    println!("{}", serde_json::to_string_pretty(&verification)?);
    Ok(())
}

async fn run(
    config: &Config,
    matches: &ArgMatches,
    wants_training: bool,
    analyze_file: Option<&String>,
) -> anyhow::Result<()> {
    let coordinator = Coordinator::from_system(config.clone())?;
    let state_path = matches.get_one::<String>("classifier-state");

    if let Some(path) = state_path.filter(|p| Path::new(p.as_str()).exists()) {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read classifier state: {path}"))?;
        let snapshot = ClassifierSnapshot::from_json(&json)
            .with_context(|| format!("Failed to parse classifier state: {path}"))?;
        with_classifier(&coordinator, |classifier| classifier.import_state(snapshot))?;
        log::info!("Loaded classifier state from {path}");
    }

    if wants_training {
        train_from_args(&coordinator, matches)?;
        if let Some(path) = state_path {
            let json = with_classifier(&coordinator, |classifier| {
                classifier.export_state().to_json()
            })??;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write classifier state: {path}"))?;
            log::info!("Saved classifier state to {path}");
        }
    }

    if let Some(path) = analyze_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read message file: {path}"))?;
        let mut inbound = InboundMessage::new(raw);
        if let Some(ip) = matches.get_one::<String>("client-ip") {
            inbound = inbound.with_client_ip(ip.as_str());
        }
        if let Some(helo) = matches.get_one::<String>("helo") {
            inbound = inbound.with_helo(helo.as_str());
        }
        let report = coordinator.analyze(&inbound).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn with_classifier<T>(
    coordinator: &Coordinator,
    f: impl FnOnce(&mut AdaptiveClassifier) -> T,
) -> anyhow::Result<T> {
    let classifier = coordinator.classifier();
    let mut guard = classifier
        .write()
        .map_err(|_| anyhow::anyhow!("classifier lock poisoned"))?;
    Ok(f(&mut guard))
}

fn train_from_args(coordinator: &Coordinator, matches: &ArgMatches) -> anyhow::Result<()> {
    let jobs = [
        ("train-spam", true, false),
        ("train-ham", false, false),
        ("untrain-spam", true, true),
        ("untrain-ham", false, true),
    ];

    for (flag, spam, reverse) in jobs {
        let Some(files) = matches.get_many::<String>(flag) else {
            continue;
        };
        for path in files {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read message file: {path}"))?;
            let context = MessageContext::from_inbound(&InboundMessage::new(raw))
                .with_context(|| format!("Failed to parse message file: {path}"))?;
            let sender = context.sender_address().unwrap_or_default().to_string();

            with_classifier(coordinator, |classifier| match (spam, reverse) {
                (true, false) => classifier.train_spam(&context.subject, &context.body, &sender),
                (false, false) => classifier.train_ham(&context.subject, &context.body, &sender),
                (was_spam, true) => {
                    classifier.untrain(&context.subject, &context.body, was_spam, &sender)
                }
            })?;
            println!("{flag}: {path}");
        }
    }

    with_classifier(coordinator, |classifier| {
        println!(
            "Classifier now holds {} tokens from {} spam and {} ham messages",
            classifier.token_count(),
            classifier.total_spam_messages(),
            classifier.total_ham_messages()
        );
    })
}
