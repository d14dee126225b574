use std::path::PathBuf;
use std::{env, fs};

use anyhow::Result;

use ccb_credit_eml::CcbCreditEmlImporter;
use ledger::Importer;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Usage:
    //   ccb_credit_eml [account] [file1.eml file2.eml ...]
    let mut account = "Liabilities:CreditCard:CCB".to_string();
    let mut files: Vec<PathBuf> = Vec::new();

    for arg in env::args().skip(1) {
        if arg.to_lowercase().ends_with(".eml") {
            files.push(PathBuf::from(arg));
        } else {
            account = arg;
        }
    }

    let importer = CcbCreditEmlImporter::new(&account);

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
        println!("no matching statements found (expected 中国建设银行信用卡*.eml)");
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
