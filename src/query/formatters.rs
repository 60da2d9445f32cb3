use crate::provider_manager::HealthSummary;
use crate::repository::{Token, TransferEvent, TransferStats};
use crate::scanner::{SyncProgress, SyncStatus};
use crate::verification::VerificationReport;
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn csv_string(header: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut wtr = Writer::from_writer(vec![]);
    let _ = wtr.write_record(header);
    for row in rows {
        let _ = wtr.write_record(&row);
    }
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

/// Two-column metric listing shared by the summary commands.
fn format_metrics<T: Serialize + ?Sized>(
    value: &T,
    rows: Vec<(&str, String)>,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Metric", "Value"]);
            for (metric, value) in rows {
                table.add_row(vec![Cell::new(metric), Cell::new(value)]);
            }
            table.to_string()
        }
        OutputFormat::Json => to_json(value),
        OutputFormat::Csv => csv_string(
            &["metric", "value"],
            rows.into_iter()
                .map(|(metric, value)| vec![metric.to_string(), value])
                .collect(),
        ),
    }
}

fn or_na<T: ToString>(value: Option<T>) -> String {
    value.map_or("N/A".to_string(), |v| v.to_string())
}

fn short_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

pub fn format_status(status: &SyncStatus, format: &OutputFormat) -> String {
    let mut rows = vec![
        ("Last Finalized Block", status.last_finalized_block.to_string()),
        ("Head Block", status.head_block.to_string()),
        ("Lag", status.lag.to_string()),
        ("Tokens", status.tokens_count.to_string()),
        ("Transfers", status.transfers_count.to_string()),
        ("Running", status.is_running.to_string()),
    ];
    if let Some(progress) = &status.progress {
        rows.push(("Phase", format!("{:?}", progress.phase)));
        rows.push(("Progress", format!("{:.2}%", progress.percentage)));
    }
    format_metrics(status, rows, format)
}

pub fn format_progress(progress: &SyncProgress, format: &OutputFormat) -> String {
    let rows = vec![
        ("Phase", format!("{:?}", progress.phase)),
        ("Progress", format!("{:.2}%", progress.percentage)),
        ("Blocks Remaining", progress.blocks_remaining.to_string()),
        ("ETA (s)", or_na(progress.eta_seconds)),
    ];
    format_metrics(progress, rows, format)
}

pub fn format_stats(stats: &TransferStats, format: &OutputFormat) -> String {
    let rows = vec![
        ("Total Transfers", stats.total_transfers.to_string()),
        ("Unique Tokens", stats.unique_tokens.to_string()),
        ("Unique Addresses", stats.unique_addresses.to_string()),
        ("Earliest Block", or_na(stats.earliest_block)),
        ("Latest Block", or_na(stats.latest_block)),
    ];
    format_metrics(stats, rows, format)
}

pub fn format_tokens(tokens: &[Token], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if tokens.is_empty() {
                return "No tokens found.".to_string();
            }
            let mut table = new_table(vec![
                "Token ID",
                "Owner",
                "Last Transfer Block",
                "Synced Block",
                "Token URI",
            ]);
            for token in tokens {
                table.add_row(vec![
                    Cell::new(token.token_id),
                    Cell::new(
                        token
                            .owner_address
                            .map_or("unsynced".to_string(), |o| format!("{o:#}")),
                    ),
                    Cell::new(or_na(token.last_transfer_block)),
                    Cell::new(token.last_synced_block),
                    Cell::new(token.token_uri.as_deref().unwrap_or("")),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let json_tokens: Vec<_> = tokens
                .iter()
                .map(|t| {
                    json!({
                        "token_id": t.token_id.to_string(),
                        "owner": t.owner_address.map(|o| format!("{o:?}")),
                        "token_uri": t.token_uri,
                        "last_transfer_block": t.last_transfer_block,
                        "last_transfer_tx_hash": t.last_transfer_tx_hash.map(|h| format!("{h:?}")),
                        "last_synced_block": t.last_synced_block,
                        "updated_at": t.updated_at.to_rfc3339(),
                    })
                })
                .collect();
            to_json(&json_tokens)
        }
        OutputFormat::Csv => csv_string(
            &[
                "token_id",
                "owner",
                "token_uri",
                "last_transfer_block",
                "last_synced_block",
            ],
            tokens
                .iter()
                .map(|t| {
                    vec![
                        t.token_id.to_string(),
                        t.owner_address.map(|o| format!("{o:?}")).unwrap_or_default(),
                        t.token_uri.clone().unwrap_or_default(),
                        t.last_transfer_block.map(|b| b.to_string()).unwrap_or_default(),
                        t.last_synced_block.to_string(),
                    ]
                })
                .collect(),
        ),
    }
}

pub fn format_transfers(transfers: &[TransferEvent], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if transfers.is_empty() {
                return "No transfers found.".to_string();
            }
            let mut table = new_table(vec!["Block", "Token ID", "From", "To", "Tx Hash"]);
            for transfer in transfers {
                table.add_row(vec![
                    Cell::new(transfer.block_number),
                    Cell::new(transfer.token_id),
                    Cell::new(format!("{:#}", transfer.from_address)),
                    Cell::new(format!("{:#}", transfer.to_address)),
                    Cell::new(short_hash(&format!("{:?}", transfer.transaction_hash))),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let json_transfers: Vec<_> = transfers
                .iter()
                .map(|t| {
                    json!({
                        "block_number": t.block_number,
                        "block_timestamp": t.block_timestamp,
                        "transaction_hash": format!("{:?}", t.transaction_hash),
                        "log_index": t.log_index,
                        "token_id": t.token_id.to_string(),
                        "from": format!("{:?}", t.from_address),
                        "to": format!("{:?}", t.to_address),
                    })
                })
                .collect();
            to_json(&json_transfers)
        }
        OutputFormat::Csv => csv_string(
            &[
                "block_number",
                "token_id",
                "from",
                "to",
                "transaction_hash",
                "log_index",
            ],
            transfers
                .iter()
                .map(|t| {
                    vec![
                        t.block_number.to_string(),
                        t.token_id.to_string(),
                        format!("{:?}", t.from_address),
                        format!("{:?}", t.to_address),
                        format!("{:?}", t.transaction_hash),
                        t.log_index.to_string(),
                    ]
                })
                .collect(),
        ),
    }
}

pub fn format_verification(report: &VerificationReport, format: &OutputFormat) -> String {
    if let OutputFormat::Json = format {
        return to_json(report);
    }

    let rows = vec![
        ("Result", if report.passed { "PASSED" } else { "FAILED" }.to_string()),
        ("Sample Size", report.sample_size.to_string()),
        ("Matches", report.matches.to_string()),
        ("Mismatches", report.mismatches.len().to_string()),
        ("Errors", report.errors.to_string()),
        ("Accuracy", format!("{:.2}%", report.accuracy * 100.0)),
        ("Threshold", format!("{:.2}%", report.accuracy_threshold * 100.0)),
        ("Indexed Tokens", report.total_tokens.to_string()),
        ("Total Supply", or_na(report.expected_total)),
    ];
    let mut output = format_metrics(report, rows, format);

    if let OutputFormat::Table = format {
        if !report.mismatches.is_empty() {
            let mut table = new_table(vec!["Token ID", "Stored Owner", "Chain Owner"]);
            for mismatch in &report.mismatches {
                table.add_row(vec![
                    Cell::new(mismatch.token_id),
                    Cell::new(or_na(mismatch.stored_owner.map(|o| format!("{o:#}")))),
                    Cell::new(format!("{:#}", mismatch.chain_owner)),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }
    }
    output
}

pub fn format_providers(summary: &HealthSummary, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            let mut table =
                new_table(vec!["URL", "Healthy", "Latency (ms)", "Block", "Success Rate"]);
            for provider in &summary.providers {
                let url = if provider.url == summary.current {
                    format!("{} *", provider.url)
                } else {
                    provider.url.clone()
                };
                table.add_row(vec![
                    Cell::new(url),
                    Cell::new(provider.is_healthy),
                    Cell::new(or_na(provider.latency_ms)),
                    Cell::new(or_na(provider.block_number)),
                    Cell::new(format!("{:.1}%", provider.success_rate * 100.0)),
                ]);
            }
            format!(
                "{}\n{} of {} providers healthy",
                table, summary.healthy, summary.total
            )
        }
        OutputFormat::Json => to_json(summary),
        OutputFormat::Csv => csv_string(
            &["url", "healthy", "latency_ms", "block_number", "success_rate", "current"],
            summary
                .providers
                .iter()
                .map(|p| {
                    vec![
                        p.url.clone(),
                        p.is_healthy.to_string(),
                        p.latency_ms.map(|l| l.to_string()).unwrap_or_default(),
                        p.block_number.map(|b| b.to_string()).unwrap_or_default(),
                        format!("{:.4}", p.success_rate),
                        (p.url == summary.current).to_string(),
                    ]
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::SyncPhase;

    fn status() -> SyncStatus {
        SyncStatus {
            last_finalized_block: 108,
            head_block: 110,
            lag: 2,
            tokens_count: 1,
            transfers_count: 2,
            is_running: false,
            progress: Some(SyncProgress {
                phase: SyncPhase::CaughtUp,
                percentage: 100.0,
                blocks_remaining: 0,
                eta_seconds: Some(0),
            }),
        }
    }

    #[test]
    fn status_renders_in_every_format() -> anyhow::Result<()> {
        let status = status();

        let table = format_status(&status, &OutputFormat::Table);
        assert!(table.contains("Last Finalized Block"));
        assert!(table.contains("CaughtUp"));

        let json: serde_json::Value =
            serde_json::from_str(&format_status(&status, &OutputFormat::Json))?;
        assert_eq!(json["lag"], 2);
        assert_eq!(json["progress"]["phase"], "caught_up");

        let csv = format_status(&status, &OutputFormat::Csv);
        assert!(csv.starts_with("metric,value\n"));
        assert!(csv.contains("Head Block,110"));
        Ok(())
    }

    #[test]
    fn unknown_format_falls_back_to_table() {
        assert!(matches!(OutputFormat::from("JSON"), OutputFormat::Json));
        assert!(matches!(OutputFormat::from("yaml"), OutputFormat::Table));
        assert_eq!(format_tokens(&[], &OutputFormat::Table), "No tokens found.");
    }
}
