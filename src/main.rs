use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use stackfs::{
    BranchPerm, DentryCache, DentryHandle, DirDriver, LockRank, UnionConfig, NO_BRANCH,
};

#[derive(Parser)]
#[command(name = "stackfs")]
#[command(about = "Inspect how a union of directories maps its entries to branches")]
struct Cli {
    /// Union configuration file (JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Read-write branch, topmost first (repeatable)
    #[arg(long = "rw")]
    rw: Vec<PathBuf>,

    /// Read-only branch, below the read-write ones (repeatable)
    #[arg(long = "ro")]
    ro: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the branch table
    Branches,

    /// Show which branches hold each path
    Stat {
        /// Logical paths inside the union
        paths: Vec<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the physical path each logical path resolves to
    Resolve {
        /// Logical path inside the union
        path: String,
    },
}

fn load_config(cli: &Cli) -> Result<UnionConfig> {
    let mut config = match &cli.config {
        Some(path) => UnionConfig::load(path)?,
        None => UnionConfig::default(),
    };
    for path in &cli.rw {
        config.push(path.canonicalize()?, BranchPerm::Rw);
    }
    for path in &cli.ro {
        config.push(path.canonicalize()?, BranchPerm::Ro);
    }
    Ok(config)
}

fn describe(cache: &DentryCache, dentry: &DentryHandle) -> serde_json::Value {
    let (lowest, highest) = cache.current_populated_range(dentry);
    let guard = dentry.info().read(LockRank::Child);
    let slots: Vec<_> = guard
        .populated()
        .map(|(rank, entry)| {
            serde_json::json!({
                "rank": rank,
                "branch": entry.branch().to_string(),
                "path": entry.path(),
                "kind": format!("{:?}", entry.kind()),
                "opaque": entry.is_opaque(),
            })
        })
        .collect();
    serde_json::json!({
        "path": dentry.path(),
        "lowest": lowest,
        "highest": highest,
        "whiteout": guard.whiteout(),
        "opaque": guard.opaque(),
        "generation": dentry.info().generation(),
        "slots": slots,
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let table = Arc::new(config.build_table()?);
    let cache = DentryCache::new(table.clone(), Arc::new(DirDriver::new()));

    match cli.command {
        Commands::Branches => {
            println!("{:<6} {:<6} {:<4} {}", "RANK", "ID", "PERM", "ROOT");
            for (rank, (id, root, perm)) in table.list_branches().into_iter().enumerate() {
                let perm = match perm {
                    BranchPerm::Rw => "rw",
                    BranchPerm::Ro => "ro",
                };
                println!("{:<6} {:<6} {:<4} {}", rank, id, perm, root.display());
            }
            println!("generation {}", table.generation());
        }

        Commands::Stat { paths, json } => {
            let mut out = Vec::new();
            for path in &paths {
                let dentry = cache.resolve(path)?;
                out.push(describe(&cache, &dentry));
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "{:<30} {:<8} {:<8} {:<9} {:<7}",
                    "PATH", "LOWEST", "HIGHEST", "WHITEOUT", "OPAQUE"
                );
                for entry in &out {
                    let rank = |v: &serde_json::Value| {
                        v.as_i64().map_or("-".to_string(), |r| r.to_string())
                    };
                    println!(
                        "{:<30} {:<8} {:<8} {:<9} {:<7}",
                        entry["path"].as_str().unwrap_or("-"),
                        rank(&entry["lowest"]),
                        rank(&entry["highest"]),
                        rank(&entry["whiteout"]),
                        rank(&entry["opaque"]),
                    );
                }
            }
        }

        Commands::Resolve { path } => {
            let dentry = cache.resolve(&path)?;
            let (lowest, _) = cache.current_populated_range(&dentry);
            if lowest == NO_BRANCH {
                eprintln!("Error: {} does not exist in any branch", path);
                process::exit(1);
            }
            match cache.lookup_physical(&dentry, lowest) {
                Some(entry) => println!("{}", entry.path().display()),
                None => {
                    eprintln!("Error: {} has no physical entry", path);
                    process::exit(1);
                }
            }
        }
    }

    Ok(())
}
