#![allow(clippy::uninlined_format_args)]

use mail_sentinel::config::SpfConfig;
use mail_sentinel::dns::HickoryLookup;
use mail_sentinel::SpfEvaluator;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("Testing SPF verification against live DNS...");

    let dns = HickoryLookup::from_system_conf(5)?;
    let evaluator = SpfEvaluator::new(Arc::new(dns), SpfConfig::default());

    let mut args = std::env::args().skip(1);
    let cases: Vec<(String, String, String)> = match (args.next(), args.next()) {
        (Some(ip), Some(domain)) => {
            let sender = args.next().unwrap_or_else(|| format!("postmaster@{}", domain));
            vec![(ip, domain, sender)]
        }
        _ => vec![
            // Google's published ranges include 209.85.128.0/17
            (
                "209.85.220.41".to_string(),
                "gmail.com".to_string(),
                "someone@gmail.com".to_string(),
            ),
            // Documentation address, should not be authorized anywhere
            (
                "192.0.2.1".to_string(),
                "gmail.com".to_string(),
                "someone@gmail.com".to_string(),
            ),
            (
                "192.0.2.1".to_string(),
                "example.com".to_string(),
                "test@example.com".to_string(),
            ),
        ],
    };

    for (ip, domain, sender) in cases {
        println!("\n=== {} sending for {} ({}) ===", ip, domain, sender);
        let verification = evaluator.verify(&ip, &domain, &sender, None).await;
        println!("  Result: {}", verification.result);
        if let Some(mechanism) = &verification.mechanism {
            println!("  Matched: {}", mechanism);
        }
        println!(
            "  Lookups: {} (void: {})",
            verification.lookups, verification.void_lookups
        );
        for warning in &verification.warnings {
            println!("  ⚠️  {}", warning);
        }
    }

    Ok(())
}
