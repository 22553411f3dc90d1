//! Offline view of persisted account records.

use std::{io::Write, path::Path};

use anyhow::Result;

use parrot_accounts::{
    store::{CredentialStore, StoredAccount},
    store_file::FileCredentialStore,
};

pub async fn handle_accounts(sessions_dir: &Path, owner: Option<i64>) -> Result<()> {
    let store = FileCredentialStore::new(sessions_dir);
    let report = store.load_all().await?;
    let records: Vec<StoredAccount> = report
        .records
        .into_iter()
        .filter(|r| owner.is_none_or(|o| r.key().owner.0 == o))
        .collect();

    eprintln!("Records in {}\n", sessions_dir.display());
    print_records(&records, &mut std::io::stdout())?;
    if report.skipped > 0 {
        eprintln!("\n{} unreadable record(s) skipped", report.skipped);
    }
    Ok(())
}

/// One line per account. Credentials and session tokens are never printed.
fn print_records(records: &[StoredAccount], out: &mut impl Write) -> Result<()> {
    if records.is_empty() {
        writeln!(out, "No accounts.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<20} {:<36} {:<8} {:<16} {:>6} {:>7}",
        "OWNER", "ACCOUNT", "STATUS", "CHAT", "DELAY", "REPLIES"
    )?;
    for record in records {
        let key = record.key();
        let status = &record.settings.status;
        let chat = record
            .settings
            .target
            .chat_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        writeln!(
            out,
            "{:<20} {:<36} {:<8} {:<16} {:>5}s {:>7}",
            key.owner.0,
            key.account.to_string(),
            if status.enabled { "on" } else { "off" },
            chat,
            status.reply_delay_secs,
            status.reply_count.get(),
        )?;
    }
    Ok(())
}
