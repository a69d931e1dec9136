//! Command-line surface for mergetree: import/export JSON documents,
//! edit literals by path, merge snapshots, and verify tree integrity.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mergetree_core::SecureTree;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mergetree", version, about = "Secure, mergeable, JSON-shaped tree")]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a JSON file into a tree snapshot
    Import {
        /// Private key (hex)
        #[arg(long)]
        prvkey: String,
        /// JSON file to import
        #[arg(long)]
        json: PathBuf,
        /// File to store the tree snapshot
        #[arg(long)]
        crdt: PathBuf,
        /// Print JSON to stdout
        #[arg(short, long)]
        print: bool,
    },
    /// Export a tree snapshot to a JSON file
    Export {
        #[arg(long)]
        prvkey: String,
        /// JSON file to write
        #[arg(long)]
        json: PathBuf,
        /// Tree snapshot to read
        #[arg(long)]
        crdt: PathBuf,
        #[arg(short, long)]
        print: bool,
    },
    /// Set a string literal value at a path
    SetLiteral {
        #[arg(long)]
        prvkey: String,
        /// Tree snapshot to update
        #[arg(long)]
        crdt: PathBuf,
        /// Path to the node, e.g. /friends/0/name
        #[arg(long)]
        path: String,
        /// String literal value to set
        #[arg(long)]
        value: String,
        #[arg(short, long)]
        print: bool,
    },
    /// Merge two tree snapshots into one
    Merge {
        #[arg(long)]
        prvkey: String,
        /// First snapshot to merge
        #[arg(long)]
        crdt1: PathBuf,
        /// Second snapshot to merge
        #[arg(long)]
        crdt2: PathBuf,
        /// Output snapshot after merge
        #[arg(long)]
        crdtout: PathBuf,
        #[arg(short, long)]
        print: bool,
    },
    /// Print a tree snapshot as JSON
    Print {
        #[arg(long)]
        prvkey: String,
        #[arg(long)]
        crdt: PathBuf,
    },
    /// Verify tree snapshot integrity
    Verify {
        #[arg(long)]
        prvkey: String,
        #[arg(long)]
        crdt: PathBuf,
    },
    /// Print the version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Import {
            prvkey,
            json,
            crdt,
            print,
        } => {
            info!(json = %json.display(), crdt = %crdt.display(), "importing json file");
            let mut tree = SecureTree::new(&prvkey)?;
            let data = fs::read(&json)
                .with_context(|| format!("reading {}", json.display()))?;
            tree.import_json(&data, &prvkey)?;
            write_snapshot(&tree, &crdt)?;
            if print {
                println!("{}", String::from_utf8_lossy(&data));
            }
        }
        Command::Export {
            prvkey,
            json,
            crdt,
            print,
        } => {
            info!(json = %json.display(), crdt = %crdt.display(), "exporting tree to json");
            let tree = load_snapshot(&prvkey, &crdt)?;
            let exported = tree.export_json()?;
            fs::write(&json, &exported)
                .with_context(|| format!("writing {}", json.display()))?;
            if print {
                println!("{exported}");
            }
        }
        Command::SetLiteral {
            prvkey,
            crdt,
            path,
            value,
            print,
        } => {
            info!(crdt = %crdt.display(), path, value, "setting literal");
            let mut tree = load_snapshot(&prvkey, &crdt)?;
            let node = tree.node_by_path(&path)?;
            tree.set_literal(&node, serde_json::Value::String(value), &prvkey)?;
            write_snapshot(&tree, &crdt)?;
            if print {
                println!("{}", tree.export_json()?);
            }
        }
        Command::Merge {
            prvkey,
            crdt1,
            crdt2,
            crdtout,
            print,
        } => {
            info!(
                crdt1 = %crdt1.display(),
                crdt2 = %crdt2.display(),
                crdtout = %crdtout.display(),
                "merging tree snapshots"
            );
            let mut first = load_snapshot(&prvkey, &crdt1)?;
            let second = load_snapshot(&prvkey, &crdt2)?;
            first.merge(&second, &prvkey)?;
            write_snapshot(&first, &crdtout)?;
            if print {
                println!("{}", first.export_json()?);
            }
        }
        Command::Print { prvkey, crdt } => {
            let tree = load_snapshot(&prvkey, &crdt)?;
            println!("{}", tree.export_json()?);
        }
        Command::Verify { prvkey, crdt } => {
            let tree = load_snapshot(&prvkey, &crdt)?;
            tree.verify()?;
            info!("tree integrity verified successfully");
        }
        Command::Version => {
            println!("{}", mergetree_core::version());
        }
    }
    Ok(())
}

fn load_snapshot(prvkey: &str, path: &PathBuf) -> Result<SecureTree> {
    let mut tree = SecureTree::new(prvkey)?;
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    tree.load(&data)?;
    Ok(tree)
}

fn write_snapshot(tree: &SecureTree, path: &PathBuf) -> Result<()> {
    let data = tree.save()?;
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
