use std::path::PathBuf;
use std::{env, fs};

use anyhow::Result;

use alipay::AlipayImporter;
use ledger::Importer;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Usage:
    //   alipay [account] [file1.csv file2.csv ...]
    let mut account = "Assets:Alipay".to_string();
    let mut files: Vec<PathBuf> = Vec::new();

    for arg in env::args().skip(1) {
        if arg.to_lowercase().ends_with(".csv") {
            files.push(PathBuf::from(arg));
        } else {
            account = arg;
        }
    }

    let importer = AlipayImporter::new(&account);

    if files.is_empty() {
        for entry in fs::read_dir(".")? {
            let path = entry?.path();
            if importer.identify(&path) {
                files.push(path);
            }
        }
        files.sort();
    }

    if files.is_empty() {
        println!("no matching exports found (expected *_ACCLOG.csv)");
        return Ok(());
    }

    let mut all = Vec::new();
    let mut failed = 0usize;

    for path in &files {
        match importer.extract(path) {
            Ok(entries) => {
                println!("{}: {} entries", path.display(), entries.len());
                all.extend(entries);
            }
            Err(err) => {
                eprintln!("failed importing {}: {:#}", path.display(), err);
                failed += 1;
            }
        }
    }

    let (entries, duplicates) = ledger::dedupe_transactions(all);
    println!(
        "{} entries from {} file(s), {} duplicates dropped, {} file(s) failed",
        entries.len(),
        files.len(),
        duplicates,
        failed
    );

    Ok(())
}
