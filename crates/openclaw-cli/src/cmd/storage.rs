//! `openclaw storage` subcommands: status and migrate.

use colored::Colorize;
use serde_json::json;
use std::path::Path;
use std::str::FromStr;

use openclaw_storage::{StorageBackend, StorageService};
use openclaw_types::{Namespace, StorageConfig, StorageError};

use crate::cli::{MigrateTarget, StorageCommands};

/// Run a storage subcommand, returning the process exit code.
pub async fn run(command: StorageCommands, config_path: Option<&Path>) -> i32 {
    let config = match StorageConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            return 2;
        }
    };

    let result = match command {
        StorageCommands::Status { json, health } => status(config, json, health).await,
        StorageCommands::Migrate {
            to,
            namespace,
            dry_run,
            yes,
        } => migrate(config, to, namespace.as_deref(), dry_run, yes).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            match e {
                StorageError::Config(_) | StorageError::InvalidArgument(_) => 2,
                _ => 1,
            }
        }
    }
}

async fn status(config: StorageConfig, json: bool, health: bool) -> Result<i32, StorageError> {
    let service = StorageService::new(config)?;
    service.initialize().await?;

    let summary = service.config_summary();
    let probes = if health {
        Some(service.health_check().await)
    } else {
        None
    };

    if json {
        let namespaces: Vec<_> = summary
            .iter()
            .map(|row| {
                let mut entry = json!({
                    "namespace": row.namespace,
                    "backend": row.backend,
                    "classification": row.classification,
                });
                if let Some(probes) = &probes {
                    if let Some(status) = probes.get(&row.namespace) {
                        entry["health"] = serde_json::to_value(status)
                            .unwrap_or(serde_json::Value::Null);
                    }
                }
                entry
            })
            .collect();
        let doc = json!({
            "mode": service.config().mode.as_str(),
            "baseDir": service.config().resolved_base_dir(),
            "cacheEnabled": service.config().cache_enabled,
            "cacheTtlMs": service.config().cache_ttl_ms,
            "namespaces": namespaces,
        });
        println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());
    } else {
        println!(
            "{} {}",
            "Storage mode:".bold(),
            service.config().mode.as_str().cyan()
        );
        println!(
            "{} {}",
            "Base dir:".bold(),
            service.config().resolved_base_dir().display()
        );
        println!(
            "{} enabled={} ttl={}ms",
            "Cache:".bold(),
            service.config().cache_enabled,
            service.config().cache_ttl_ms
        );
        println!();
        for row in &summary {
            let mut line = format!(
                "  {:<12} {:<16} {}",
                row.namespace.as_str(),
                row.backend.as_str(),
                row.classification.as_str().dimmed()
            );
            if let Some(probes) = &probes {
                if let Some(status) = probes.get(&row.namespace) {
                    let verdict = if status.ok {
                        format!("ok ({}ms)", status.latency_ms).green().to_string()
                    } else {
                        format!(
                            "unhealthy: {}",
                            status.error.as_deref().unwrap_or("unknown")
                        )
                        .red()
                        .to_string()
                    };
                    line.push_str(&format!("  {verdict}"));
                }
            }
            println!("{line}");
        }
    }

    service.close().await?;
    Ok(0)
}

async fn migrate(
    config: StorageConfig,
    target: MigrateTarget,
    namespace: Option<&str>,
    dry_run: bool,
    yes: bool,
) -> Result<i32, StorageError> {
    let namespaces: Vec<Namespace> = match namespace {
        Some(raw) => vec![Namespace::from_str(raw)?],
        None => Namespace::ALL.to_vec(),
    };

    if !dry_run {
        // Copying data is not wired up yet; enumeration is. A --yes run
        // falls through to the enumeration instead of erroring.
        if !yes {
            eprintln!(
                "{} migration execution is not implemented; run with --dry-run \
                 (or --yes) to enumerate what would move",
                "Error:".red().bold()
            );
            return Ok(1);
        }
        println!(
            "{}",
            "Migration execution is not implemented yet; enumerating only.".dimmed()
        );
    } else if !yes {
        println!(
            "{}",
            "Dry run (no confirmation needed, nothing will be moved).".dimmed()
        );
    }

    let service = StorageService::new(config)?;
    service.initialize().await?;

    println!(
        "{} target backend: {}",
        "Migration plan,".bold(),
        target.as_str().cyan()
    );
    let mut total = 0usize;
    for ns in namespaces {
        let backend = service.backend(ns).await?;
        if backend.kind().as_str() == target.as_str() {
            println!(
                "  {:<12} already on {}, nothing to do",
                ns.as_str(),
                target.as_str()
            );
            continue;
        }
        let keys = backend.list(ns, None).await?;
        total += keys.len();
        println!(
            "  {:<12} {} entr{} on {} would move to {}",
            ns.as_str(),
            keys.len(),
            if keys.len() == 1 { "y" } else { "ies" },
            backend.kind().as_str(),
            target.as_str()
        );
    }
    println!("{} {total} entries total; no data was moved.", "Dry run:".bold());

    service.close().await?;
    Ok(0)
}
