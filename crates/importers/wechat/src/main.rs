use std::path::PathBuf;
use std::{env, fs};

use anyhow::Result;

use ledger::Importer;
use wechat::WechatImporter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Usage:
    //   wechat [account] [file1.csv file2.csv ...]
    //
    // Payment-method mappings beyond the wallet itself are added in code via
    // `with_account`; unmapped methods post to Assets:FIXME flagged `!`.
    let mut account = "Assets:WeChat".to_string();
    let mut files: Vec<PathBuf> = Vec::new();

    for arg in env::args().skip(1) {
        if arg.to_lowercase().ends_with(".csv") {
            files.push(PathBuf::from(arg));
        } else {
            account = arg;
        }
    }

    let importer = WechatImporter::new(&account);

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
        println!("no matching exports found (expected 微信支付账单(YYYYMMDD-YYYYMMDD).csv)");
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
