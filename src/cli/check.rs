//! Check command: validate the server-list file and print the catalog the
//! proxy would actually run with.

use crate::cli::CheckArgs;
use crate::config::ServerListConfig;
use crate::registry::ServerRegistry;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};

pub fn run_check(args: &CheckArgs) -> anyhow::Result<()> {
    let config = ServerListConfig::load(&args.config)?;
    let registry = ServerRegistry::from_config(&config);

    println!("{}", format!("config: {}", args.config.display()).bold());
    println!();

    let mut servers = Table::new();
    servers.load_preset(UTF8_FULL).set_header(vec![
        "name",
        "health base",
        "model base",
        "request max",
    ]);
    for server in registry.servers() {
        servers.add_row(vec![
            server.name.clone(),
            server.health_base(),
            server.model_base(),
            server
                .request_max
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{servers}");
    println!();

    let mut rules = Table::new();
    rules
        .load_preset(UTF8_FULL)
        .set_header(vec!["pattern", "servers"]);
    for rule in registry.rules() {
        rules.add_row(vec![rule.pattern.clone(), rule.servers.join(", ")]);
    }
    println!("{rules}");
    println!();

    match registry.fallback_backend() {
        Some(fallback) => println!("fallback: {}", fallback.green()),
        None => println!("{}", "fallback: none configured".yellow()),
    }

    let dropped = config.rules.len() - registry.rules().len();
    if dropped > 0 {
        println!(
            "{}",
            format!("{dropped} rule(s) dropped (bad regex or unknown servers)").yellow()
        );
    }

    Ok(())
}
