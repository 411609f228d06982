use crate::result_db::ResultDb;
use log::{info, warn};
use reqwest::Client;
use std::time::Duration;

/// Reconciles the contact-list spreadsheet into `application_status`
/// rows once per coordinator iteration, the same periodic-poll-and-act
/// shape `bin/sentinel`'s `Probe` uses for its HTTP check, minus the
/// failure-threshold alerting: this isn't a health check, it's a data
/// sync.
pub struct ApplicationStatusUpdater {
    client: Client,
    spreadsheet_url: Option<String>,
    ignore: bool,
}

impl ApplicationStatusUpdater {
    pub fn new(spreadsheet_url: Option<String>, ignore: bool) -> Self {
        if ignore {
            info!("IGNORE_APPLICATION_STATUS set; application status updates are disabled");
        }
        ApplicationStatusUpdater {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            spreadsheet_url,
            ignore,
        }
    }

    /// Fetches the spreadsheet and upserts it into `application_status`.
    /// A no-op when `IGNORE_APPLICATION_STATUS` is set or no spreadsheet
    /// URL is configured. Fetch/parse failures are logged and swallowed:
    /// a stale contact list must never stall the batch loop.
    pub async fn refresh(&self, result_db: &dyn ResultDb) {
        if self.ignore {
            return;
        }
        let Some(url) = &self.spreadsheet_url else {
            return;
        };

        let body = match self.client.get(url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to read application status spreadsheet body: {e:?}");
                    return;
                }
            },
            Err(e) => {
                warn!("failed to fetch application status spreadsheet: {e:?}");
                return;
            }
        };

        let statuses = parse_contact_list(&body);
        if let Err(e) = result_db.update_application_status(&statuses).await {
            warn!("failed to persist application status: {e:?}");
        }
    }
}

/// Parses a CSV contact list of `block_producer_key,is_active` rows.
/// Tolerates a header line (any row whose second column doesn't parse
/// as a bool is skipped) and blank lines.
fn parse_contact_list(body: &str) -> Vec<(String, bool)> {
    body.lines()
        .filter_map(|line| {
            let mut cols = line.splitn(2, ',');
            let key = cols.next()?.trim();
            let flag = cols.next()?.trim();
            if key.is_empty() {
                return None;
            }
            flag.parse::<bool>().ok().map(|active| (key.to_string(), active))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_rows_and_skips_header() {
        let body = "block_producer_key,is_active\nnode-a,true\nnode-b,false\n\nnode-c,not-a-bool";
        let parsed = parse_contact_list(body);
        assert_eq!(parsed, vec![("node-a".to_string(), true), ("node-b".to_string(), false)]);
    }

    #[test]
    fn empty_body_produces_empty_list() {
        assert!(parse_contact_list("").is_empty());
    }
}
